//! Standalone Leaflet web maps.
//!
//! A [`LeafletMap`] renders to a single HTML page loading Leaflet and the
//! fullscreen plugin from a CDN, with the GeoJSON layers inlined in the page.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::collect::global_variables::EPSG_WGS84;
use crate::collect::layer::FeatureLayer;
use crate::commons::geometry::representative_point;
use crate::error::Error;

const LEAFLET_CSS: &str = "https://cdn.jsdelivr.net/npm/leaflet@1.9.3/dist/leaflet.css";
const LEAFLET_JS: &str = "https://cdn.jsdelivr.net/npm/leaflet@1.9.3/dist/leaflet.js";
const FULLSCREEN_CSS: &str =
    "https://cdn.jsdelivr.net/npm/leaflet.fullscreen@3.0.0/Control.FullScreen.css";
const FULLSCREEN_JS: &str =
    "https://cdn.jsdelivr.net/npm/leaflet.fullscreen@3.0.0/Control.FullScreen.min.js";

pub const DEFAULT_TOOLTIP_STYLE: &str =
    "background-color: #FEEFF2; color: #333333; font-family: arial; font-size: 10px; padding: 8px;";

/// Basemap tiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileLayer {
    /// Name shown in the layer control
    pub name: String,
    pub url: String,
    pub attribution: String,
    pub subdomains: String,
    pub max_zoom: u8,
}

impl TileLayer {
    pub fn cartodb_positron() -> Self {
        TileLayer {
            name: "cartodbpositron".to_string(),
            url: "https://{s}.basemaps.cartocdn.com/light_all/{z}/{x}/{y}{r}.png".to_string(),
            attribution: "&copy; <a href=\"https://www.openstreetmap.org/copyright\">OpenStreetMap</a> contributors &copy; <a href=\"https://carto.com/attributions\">CARTO</a>".to_string(),
            subdomains: "abcd".to_string(),
            max_zoom: 20,
        }
    }

    pub fn openstreetmap() -> Self {
        TileLayer {
            name: "openstreetmap".to_string(),
            url: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            attribution: "&copy; <a href=\"https://www.openstreetmap.org/copyright\">OpenStreetMap</a> contributors".to_string(),
            subdomains: "abc".to_string(),
            max_zoom: 19,
        }
    }

    /// Tiles by name, case-insensitive
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cartodbpositron" | "cartodb positron" => Some(TileLayer::cartodb_positron()),
            "openstreetmap" => Some(TileLayer::openstreetmap()),
            _ => None,
        }
    }
}

impl Default for TileLayer {
    fn default() -> Self {
        TileLayer::cartodb_positron()
    }
}

/// Leaflet path options; unset fields are left to Leaflet's defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_opacity: Option<f64>,
}

impl PathStyle {
    /// White outline, navy fill
    pub fn parcels() -> Self {
        PathStyle {
            color: Some("#FFFFFF".to_string()),
            fill_color: Some("#00205B".to_string()),
            weight: Some(2.0),
            opacity: Some(0.5),
            fill_opacity: Some(0.6),
        }
    }

    /// Red outline on hover
    pub fn highlight() -> Self {
        PathStyle {
            color: Some("#BA0C2F".to_string()),
            fill_opacity: Some(0.2),
            ..PathStyle::default()
        }
    }
}

/// One GeoJSON overlay with styling, hover tooltip and optional click popup
#[derive(Debug, Clone)]
pub struct GeoJsonLayer {
    pub name: String,
    data: Value,
    pub style: PathStyle,
    pub highlight: Option<PathStyle>,
    pub tooltip_fields: Vec<String>,
    pub tooltip_style: String,
    pub click_popup: bool,
}

impl GeoJsonLayer {
    /// The layer must be in EPSG:4326
    pub fn from_layer(layer: &FeatureLayer, name: &str) -> Result<Self> {
        if layer.epsg != EPSG_WGS84 {
            return Err(Error::NotGeographic(layer.epsg).into());
        }

        let mut collection = layer.to_feature_collection(Some(name));
        // Popup anchor: a point inside each geometry, as [lat, lon]
        for (feature, source) in collection.features.iter_mut().zip(&layer.features) {
            if let Some(point) = source.geometry.as_ref().and_then(representative_point) {
                feature
                    .foreign_members
                    .get_or_insert_with(Default::default)
                    .insert("anchor".to_string(), json!([point.y(), point.x()]));
            }
        }
        collection.foreign_members = None;

        Ok(GeoJsonLayer {
            name: name.to_string(),
            data: serde_json::to_value(&collection).context("Failed to serialize layer")?,
            style: PathStyle::parcels(),
            highlight: Some(PathStyle::highlight()),
            tooltip_fields: layer.column_names(),
            tooltip_style: DEFAULT_TOOLTIP_STYLE.to_string(),
            click_popup: false,
        })
    }

    pub fn with_style(mut self, style: PathStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_highlight(mut self, highlight: Option<PathStyle>) -> Self {
        self.highlight = highlight;
        self
    }

    pub fn with_tooltip_fields(mut self, fields: Vec<String>) -> Self {
        self.tooltip_fields = fields;
        self
    }

    pub fn with_click_popup(mut self, click_popup: bool) -> Self {
        self.click_popup = click_popup;
        self
    }

    pub fn feature_count(&self) -> usize {
        self.data
            .get("features")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Layer switcher options
#[derive(Debug, Clone, PartialEq)]
pub struct LayerControl {
    pub position: String,
    pub collapsed: bool,
    pub auto_z_index: bool,
}

impl Default for LayerControl {
    fn default() -> Self {
        LayerControl {
            position: "topright".to_string(),
            collapsed: false,
            auto_z_index: true,
        }
    }
}

/// Interactive web map builder
#[derive(Debug, Clone)]
pub struct LeafletMap {
    tiles: TileLayer,
    left: String,
    width: String,
    height: String,
    location: Option<[f64; 2]>,
    zoom_start: Option<u8>,
    title: Option<String>,
    layers: Vec<GeoJsonLayer>,
    fullscreen: bool,
    layer_control: Option<LayerControl>,
    bounds: Option<[[f64; 2]; 2]>,
}

impl Default for LeafletMap {
    fn default() -> Self {
        LeafletMap {
            tiles: TileLayer::default(),
            left: "5%".to_string(),
            width: "90%".to_string(),
            height: "90%".to_string(),
            location: None,
            zoom_start: None,
            title: None,
            layers: Vec::new(),
            fullscreen: false,
            layer_control: None,
            bounds: None,
        }
    }
}

impl LeafletMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tiles(mut self, tiles: TileLayer) -> Self {
        self.tiles = tiles;
        self
    }

    /// CSS placement of the map container
    pub fn size(mut self, left: &str, width: &str, height: &str) -> Self {
        self.left = left.to_string();
        self.width = width.to_string();
        self.height = height.to_string();
        self
    }

    pub fn zoom_start(mut self, zoom: u8) -> Self {
        self.zoom_start = Some(zoom);
        self
    }

    /// Heading shown above the map
    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    /// Map centre as `[lat, lon]`
    pub fn set_location(&mut self, location: [f64; 2]) {
        self.location = Some(location);
    }

    pub fn add_geojson_layer(&mut self, layer: GeoJsonLayer) {
        self.layers.push(layer);
    }

    pub fn add_fullscreen(&mut self) {
        self.fullscreen = true;
    }

    pub fn add_layer_control(&mut self, control: LayerControl) {
        self.layer_control = Some(control);
    }

    /// `[[south, west], [north, east]]`
    pub fn fit_bounds(&mut self, bounds: [[f64; 2]; 2]) {
        self.bounds = Some(bounds);
    }

    pub fn layers(&self) -> &[GeoJsonLayer] {
        &self.layers
    }

    /// Full HTML document
    pub fn render(&self, page_title: &str) -> Result<String> {
        let mut html = String::new();

        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
        html.push_str("<meta http-equiv=\"content-type\" content=\"text/html; charset=UTF-8\" />\n");
        writeln!(html, "<title>{}</title>", escape_html(page_title))?;
        html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0, maximum-scale=1.0, user-scalable=no\" />\n");
        writeln!(html, "<link rel=\"stylesheet\" href=\"{}\"/>", LEAFLET_CSS)?;
        writeln!(html, "<script src=\"{}\"></script>", LEAFLET_JS)?;
        if self.fullscreen {
            writeln!(html, "<link rel=\"stylesheet\" href=\"{}\"/>", FULLSCREEN_CSS)?;
            writeln!(html, "<script src=\"{}\"></script>", FULLSCREEN_JS)?;
        }

        html.push_str("<style>\n");
        html.push_str("html, body { width: 100%; height: 100%; margin: 0; padding: 0; }\n");
        writeln!(
            html,
            "#map {{ position: relative; width: {}; height: {}; left: {}; top: 0%; }}",
            self.width, self.height, self.left
        )?;
        html.push_str(".leaflet-tooltip table { border-collapse: collapse; }\n");
        html.push_str(".leaflet-tooltip th { text-align: left; padding-right: 6px; }\n");
        for (i, layer) in self.layers.iter().enumerate() {
            writeln!(html, ".leaflet-tooltip.tooltip-{} {{ {} }}", i, layer.tooltip_style)?;
        }
        html.push_str("</style>\n</head>\n<body>\n");

        if let Some(title) = self.title.as_deref() {
            writeln!(
                html,
                "<h1 align=\"center\" style=\"font-size:16px\">{}</h1>",
                escape_html(title)
            )?;
        }
        html.push_str("<div id=\"map\"></div>\n<script>\n");
        html.push_str(SCRIPT_HELPERS);

        // Without a location Leaflet still needs a view until fitBounds runs
        let (center, zoom) = match self.location {
            Some(location) => (location, self.zoom_start.unwrap_or(10)),
            None => ([0.0, 0.0], self.zoom_start.unwrap_or(1)),
        };
        writeln!(
            html,
            "var map = L.map(\"map\", {{center: {}, zoom: {}, zoomControl: true, preferCanvas: false}});",
            json!(center),
            zoom
        )?;

        let tiles = &self.tiles;
        writeln!(
            html,
            "var tiles = L.tileLayer({}, {{attribution: {}, subdomains: {}, maxZoom: {}}}).addTo(map);",
            script_json(&json!(tiles.url)),
            script_json(&json!(tiles.attribution)),
            script_json(&json!(tiles.subdomains)),
            tiles.max_zoom
        )?;

        for (i, layer) in self.layers.iter().enumerate() {
            self.render_layer(&mut html, i, layer)?;
        }

        if self.fullscreen {
            html.push_str("L.control.fullscreen({position: \"topleft\", title: \"Full Screen\", titleCancel: \"Exit Full Screen\", forceSeparateButton: false}).addTo(map);\n");
        }

        if let Some(control) = self.layer_control.as_ref() {
            let overlays: Vec<String> = self
                .layers
                .iter()
                .enumerate()
                .map(|(i, l)| format!("{}: layer_{}", script_json(&json!(l.name)), i))
                .collect();
            writeln!(
                html,
                "L.control.layers({{{}: tiles}}, {{{}}}, {{position: {}, collapsed: {}, autoZIndex: {}}}).addTo(map);",
                script_json(&json!(tiles.name)),
                overlays.join(", "),
                script_json(&json!(control.position)),
                control.collapsed,
                control.auto_z_index
            )?;
        }

        if let Some(bounds) = self.bounds {
            writeln!(html, "map.fitBounds({}, {{}});", json!(bounds))?;
        }

        html.push_str("</script>\n</body>\n</html>\n");
        Ok(html)
    }

    fn render_layer(&self, html: &mut String, i: usize, layer: &GeoJsonLayer) -> Result<()> {
        let style = serde_json::to_value(&layer.style).context("Failed to serialize layer style")?;
        let highlight = match layer.highlight.as_ref() {
            Some(h) => serde_json::to_value(h).context("Failed to serialize highlight style")?,
            None => Value::Null,
        };

        writeln!(html, "var data_{} = {};", i, script_json(&layer.data))?;
        writeln!(html, "var style_{} = {};", i, script_json(&style))?;
        writeln!(html, "var highlight_{} = {};", i, script_json(&highlight))?;
        writeln!(
            html,
            "var layer_{i} = L.geoJson(data_{i}, {{style: function(feature) {{ return style_{i}; }}, onEachFeature: function(feature, layer) {{ bindFeature(layer_{i}, feature, layer, highlight_{i}, {popup}); }}}});",
            i = i,
            popup = layer.click_popup
        )?;
        writeln!(
            html,
            "layer_{}.bindTooltip(tooltipFor({}), {{sticky: true, className: \"tooltip-{}\"}});",
            i,
            script_json(&json!(layer.tooltip_fields)),
            i
        )?;
        writeln!(html, "layer_{}.addTo(map);", i)?;
        Ok(())
    }

    /// Write the page, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P, page_title: &str) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let html = self.render(page_title)?;
        fs::write(path, html)
            .with_context(|| format!("Failed to write map: {}", path.display()))?;
        info!("Map saved to {}", path.display());
        Ok(())
    }
}

const SCRIPT_HELPERS: &str = r#"function escapeHtml(value) {
  return String(value).replace(/[&<>"']/g, function(c) {
    return {"&": "&amp;", "<": "&lt;", ">": "&gt;", "\"": "&quot;", "'": "&#39;"}[c];
  });
}
function tooltipFor(fields) {
  return function(layer) {
    var props = layer.feature.properties || {};
    var rows = fields.map(function(field) {
      var value = props[field];
      var text = (value === null || value === undefined) ? "" : escapeHtml(value);
      return "<tr><th>" + escapeHtml(field) + "</th><td>" + text + "</td></tr>";
    });
    return "<table>" + rows.join("") + "</table>";
  };
}
function bindFeature(group, feature, layer, highlight, popup) {
  if (highlight) {
    layer.on({
      mouseover: function(e) { e.target.setStyle(highlight); },
      mouseout: function(e) { group.resetStyle(e.target); }
    });
  }
  if (popup) {
    layer.on("click", function(e) {
      var anchor = feature.anchor || [e.latlng.lat, e.latlng.lng];
      L.popup({maxWidth: 300, closeButton: true, closeOnEscapeKey: true, autoClose: true})
        .setLatLng(anchor)
        .setContent("<strong>" + escapeHtml(JSON.stringify(feature.properties)) + "</strong>")
        .openOn(map);
    });
  }
}
"#;

/// JSON safe to inline in a `<script>` element
fn script_json(value: &Value) -> String {
    value.to_string().replace("</", "<\\/")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
