use anyhow::{Context, Result};
use geo::{Centroid, Point};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::collect::global_variables::{
    DATETIME_FIELDS, EPSG_BRITISH_NATIONAL_GRID, EPSG_WGS84, PARCELS_LAYER,
};
use crate::collect::layer::FeatureLayer;
use crate::commons::geometry::{to_multi_polygon, union_all};
use crate::geo_core::GeoCore;
use crate::visual::leaflet::{GeoJsonLayer, LayerControl, LeafletMap, TileLayer};

pub const PARCELS_MAP_TITLE: &str = "Parcels owned by foreign and domestic companies";
pub const PARCELS_PAGE_TITLE: &str = "Norwich Parcels";
pub const DEFAULT_PARCELS_MAP: &str = "./solutions/3.map.folium.html";
pub const DEFAULT_ZOOM_START: u8 = 9;

/// Display options shared by the parcel maps
#[derive(Debug, Clone)]
pub struct MapOptions {
    pub title: String,
    pub layer_name: String,
    pub zoom_start: Option<u8>,
    pub click_popup: bool,
    pub tiles: TileLayer,
}

/// Step 3: web map of the parcels with their ownership
pub struct ParcelMap {
    parcels_path: PathBuf,
    output_path: PathBuf,
    pub geo_core: GeoCore,
    parcels_layer: Option<String>,
    page_title: String,
    options: MapOptions,
    map: Option<LeafletMap>,
}

impl ParcelMap {
    pub fn new(parcels_path: impl Into<PathBuf>, output_html: Option<String>) -> Result<Self> {
        let output_path = PathBuf::from(output_html.as_deref().unwrap_or(DEFAULT_PARCELS_MAP));
        let mut geo_core = GeoCore::new(EPSG_WGS84);
        geo_core.set_output_path(Some(output_path.to_string_lossy().to_string()));

        Ok(ParcelMap {
            parcels_path: parcels_path.into(),
            output_path,
            geo_core,
            parcels_layer: Some(PARCELS_LAYER.to_string()),
            page_title: PARCELS_PAGE_TITLE.to_string(),
            options: MapOptions {
                title: PARCELS_MAP_TITLE.to_string(),
                layer_name: PARCELS_LAYER.to_string(),
                zoom_start: Some(DEFAULT_ZOOM_START),
                click_popup: false,
                tiles: TileLayer::default(),
            },
            map: None,
        })
    }

    pub fn set_parcels_layer(&mut self, layer: Option<String>) {
        self.parcels_layer = layer;
    }

    pub fn set_titles(&mut self, title: &str, page_title: &str) {
        self.options.title = title.to_string();
        self.page_title = page_title.to_string();
    }

    pub fn set_zoom_start(&mut self, zoom: Option<u8>) {
        self.options.zoom_start = zoom;
    }

    /// Show every attribute in a popup when a parcel is clicked
    pub fn set_click_popup(&mut self, click_popup: bool) {
        self.options.click_popup = click_popup;
    }

    pub fn set_tiles(&mut self, tiles: TileLayer) {
        self.options.tiles = tiles;
    }

    pub fn run(mut self) -> Result<Self> {
        self.run_internal()?;
        Ok(self)
    }

    /// A missing parcels file still yields a map, without the parcels layer
    pub fn run_internal(&mut self) -> Result<()> {
        if !self.parcels_path.is_file() {
            warn!(
                "Parcels file {} not found, saving a map without parcels",
                self.parcels_path.display()
            );
            self.map = Some(empty_map(&self.options));
            return Ok(());
        }

        let parcels = FeatureLayer::read(&self.parcels_path, self.parcels_layer.as_deref(), None, None)
            .context("Failed to read parcels")?;
        let center = map_center(&parcels)?;

        let parcels = parcels
            .to_crs(EPSG_WGS84)
            .context("Failed to reproject parcels to EPSG:4326")?
            .explode();
        self.geo_core.set_bbox(parcels.total_bounds());

        let mut map = layer_map(parcels, &self.options)?;
        if let Some(center) = center {
            map.set_location([center.y(), center.x()]);
        }
        self.map = Some(map);
        Ok(())
    }

    pub fn get_map(&self) -> Option<&LeafletMap> {
        self.map.as_ref()
    }

    /// Write the HTML page
    pub fn save(&self) -> Result<()> {
        let map = self
            .map
            .as_ref()
            .context("No map available. Call run() first.")?;
        map.save(&self.output_path, &self.page_title)
    }

    pub fn get_output_path(&self) -> &Path {
        &self.output_path
    }
}

/// Map with only tiles, heading and controls
pub(crate) fn empty_map(options: &MapOptions) -> LeafletMap {
    let mut map = LeafletMap::new()
        .tiles(options.tiles.clone())
        .title(&options.title);
    if let Some(zoom) = options.zoom_start {
        map = map.zoom_start(zoom);
    }
    map
}

/// Map of a WGS84 layer: styled overlay with tooltips on every column,
/// fullscreen and layer controls, zoomed to the layer bounds
pub(crate) fn layer_map(mut layer: FeatureLayer, options: &MapOptions) -> Result<LeafletMap> {
    layer.stringify_columns(DATETIME_FIELDS);
    let bounds = layer.total_bounds();

    let mut map = empty_map(options);
    let overlay = GeoJsonLayer::from_layer(&layer, &options.layer_name)?
        .with_click_popup(options.click_popup);
    info!(
        "Map layer '{}' with {} features",
        options.layer_name,
        overlay.feature_count()
    );
    map.add_geojson_layer(overlay);
    map.add_fullscreen();
    map.add_layer_control(LayerControl::default());
    if let Some(bounds) = bounds {
        map.fit_bounds(bounds.to_leaflet_bounds());
    }
    Ok(map)
}

/// Area-weighted centroid of the dissolved parcels, computed on the National
/// Grid (or the layer's own projected CRS) and returned as lon/lat
pub fn map_center(layer: &FeatureLayer) -> Result<Option<Point<f64>>> {
    let projected = if layer.epsg == EPSG_WGS84 {
        layer.clone().to_crs(EPSG_BRITISH_NATIONAL_GRID)?
    } else {
        layer.clone()
    };

    let polygons = projected
        .features
        .iter()
        .filter_map(|f| f.geometry.as_ref())
        .filter_map(to_multi_polygon)
        .collect();
    let Some(centroid) = union_all(polygons).centroid() else {
        return Ok(None);
    };

    let point = GeoCore::transform_point(projected.epsg, EPSG_WGS84, centroid)?;
    Ok(Some(point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::layer::LayerFeature;
    use geo::{polygon, Geometry, MultiPolygon};
    use serde_json::{json, Map};

    fn parcels_27700() -> FeatureLayer {
        let mut props = Map::new();
        props.insert("TITLE_NO".into(), json!("NK1"));
        props.insert("INSERT".into(), json!("2012/08/03 00:00:00"));
        let a: geo::Polygon<f64> = polygon![
            (x: 623_000.0, y: 308_000.0), (x: 623_200.0, y: 308_000.0), (x: 623_200.0, y: 308_200.0), (x: 623_000.0, y: 308_200.0), (x: 623_000.0, y: 308_000.0),
        ];
        let b: geo::Polygon<f64> = polygon![
            (x: 624_000.0, y: 309_000.0), (x: 624_100.0, y: 309_000.0), (x: 624_100.0, y: 309_100.0), (x: 624_000.0, y: 309_100.0), (x: 624_000.0, y: 309_000.0),
        ];
        FeatureLayer::with_features(
            Some("parcels".into()),
            27700,
            vec![LayerFeature::new(
                Some(Geometry::MultiPolygon(MultiPolygon::new(vec![a, b]))),
                props,
            )],
        )
    }

    #[test]
    fn test_map_center_is_area_weighted() {
        let center = map_center(&parcels_27700()).unwrap().unwrap();
        // Centroid on the grid: the larger square weighs four times more
        let expected = GeoCore::transform_point(
            27700,
            4326,
            Point::new((623_100.0 * 4.0 + 624_050.0) / 5.0, (308_100.0 * 4.0 + 309_050.0) / 5.0),
        )
        .unwrap();
        assert!((center.x() - expected.x()).abs() < 1e-6);
        assert!((center.y() - expected.y()).abs() < 1e-6);
    }

    #[test]
    fn test_run_builds_exploded_map() {
        let dir = tempfile::tempdir().unwrap();
        let parcels_path = dir.path().join("NSD_joined.geojson");
        parcels_27700().write(&parcels_path, None).unwrap();
        let html_path = dir.path().join("3.map.folium.html");

        let step = ParcelMap::new(&parcels_path, Some(html_path.to_string_lossy().to_string()))
            .unwrap()
            .run()
            .unwrap();
        let map = step.get_map().unwrap();
        assert_eq!(map.layers().len(), 1);
        assert_eq!(map.layers()[0].feature_count(), 2);
        assert_eq!(map.layers()[0].name, "parcels");

        step.save().unwrap();
        let html = std::fs::read_to_string(&html_path).unwrap();
        assert!(html.contains("<title>Norwich Parcels</title>"));
        assert!(html.contains(PARCELS_MAP_TITLE));
        assert!(html.contains("zoom: 9"));
        assert!(html.contains("2012-08-03T00:00:00"));
        assert!(html.contains("map.fitBounds("));
    }

    #[test]
    fn test_missing_parcels_still_saves_map() {
        let dir = tempfile::tempdir().unwrap();
        let html_path = dir.path().join("map.html");
        let step = ParcelMap::new(
            dir.path().join("missing.geojson"),
            Some(html_path.to_string_lossy().to_string()),
        )
        .unwrap()
        .run()
        .unwrap();
        assert!(step.get_map().unwrap().layers().is_empty());
        step.save().unwrap();
        assert!(html_path.is_file());
    }
}
