use anyhow::{Context, Result};
use geo::{BoundingRect, Geometry};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::collect::global_variables::EPSG_WGS84;
use crate::commons::basic_functions::process_datetime;
use crate::commons::filter::Expr;
use crate::error::Error;
use crate::geo_core::{BoundingBox, Reprojector};

/// One row of a layer: optional geometry plus ordered attribute columns
#[derive(Debug, Clone, PartialEq)]
pub struct LayerFeature {
    pub geometry: Option<Geometry<f64>>,
    pub properties: Map<String, Value>,
}

impl LayerFeature {
    pub fn new(geometry: Option<Geometry<f64>>, properties: Map<String, Value>) -> Self {
        LayerFeature {
            geometry,
            properties,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.properties.get(column)
    }
}

/// In-memory vector layer (a table of features sharing one CRS)
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLayer {
    /// Layer name (GeoJSON `name` member)
    pub name: Option<String>,
    /// EPSG code of the geometries
    pub epsg: i32,
    pub features: Vec<LayerFeature>,
}

impl FeatureLayer {
    pub fn new(name: Option<String>, epsg: i32) -> Self {
        FeatureLayer {
            name,
            epsg,
            features: Vec::new(),
        }
    }

    pub fn with_features(name: Option<String>, epsg: i32, features: Vec<LayerFeature>) -> Self {
        FeatureLayer {
            name,
            epsg,
            features,
        }
    }

    /// Parse a GeoJSON FeatureCollection (or a single Feature).
    ///
    /// The CRS comes from the legacy `crs` member when present, EPSG:4326
    /// otherwise; `set_crs` overrides both.
    pub fn from_geojson_str(text: &str, layer: Option<&str>, set_crs: Option<i32>) -> Result<Self> {
        let geojson: GeoJson = text.parse().context("Failed to parse GeoJSON")?;

        let (features, foreign_members) = match geojson {
            GeoJson::FeatureCollection(fc) => (fc.features, fc.foreign_members),
            GeoJson::Feature(f) => (vec![f], None),
            GeoJson::Geometry(_) => {
                anyhow::bail!("GeoJSON must be a Feature or FeatureCollection");
            }
        };

        let name = foreign_members
            .as_ref()
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if let (Some(requested), Some(found)) = (layer, name.as_deref()) {
            if requested != found {
                warn!(
                    "Requested layer '{}' but the file holds '{}', reading it anyway",
                    requested, found
                );
            }
        }

        let declared = foreign_members
            .as_ref()
            .and_then(|m| m.get("crs"))
            .and_then(parse_crs_member);
        let epsg = set_crs.or(declared).unwrap_or(EPSG_WGS84);

        let mut out = Vec::with_capacity(features.len());
        for (idx, feature) in features.into_iter().enumerate() {
            let geometry = match feature.geometry {
                Some(g) => {
                    let geom: Geometry<f64> = (&g.value)
                        .try_into()
                        .with_context(|| format!("Failed to convert geometry of feature {}", idx))?;
                    Some(geom)
                }
                None => None,
            };
            out.push(LayerFeature::new(geometry, feature.properties.unwrap_or_default()));
        }

        Ok(FeatureLayer {
            name: name.or_else(|| layer.map(str::to_string)),
            epsg,
            features: out,
        })
    }

    /// Read a layer from disk, optionally keeping only rows matching `where_clause`.
    ///
    /// GeoJSON is parsed directly; other vector formats go through `ogr2ogr`
    /// when the `gdal` feature is enabled.
    pub fn read<P: AsRef<Path>>(
        path: P,
        layer: Option<&str>,
        where_clause: Option<&str>,
        set_crs: Option<i32>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            anyhow::bail!("Input file not found: {}", path.display());
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let text = match extension.as_str() {
            "geojson" | "json" => fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            _ => convert_to_geojson(path, layer)?,
        };

        let mut out = Self::from_geojson_str(&text, layer, set_crs)
            .with_context(|| format!("Failed to load layer from {}", path.display()))?;

        if let Some(clause) = where_clause {
            let expr = Expr::parse(clause)
                .with_context(|| format!("Invalid where clause: {}", clause))?;
            let before = out.len();
            out.filter(&expr);
            debug!("where '{}' kept {} of {} features", clause, out.len(), before);
        }

        info!(
            "Read {} features from {} (EPSG:{})",
            out.len(),
            path.display(),
            out.epsg
        );
        Ok(out)
    }

    pub fn to_feature_collection(&self, layer_name: Option<&str>) -> FeatureCollection {
        let features = self
            .features
            .iter()
            .map(|f| Feature {
                bbox: None,
                geometry: f
                    .geometry
                    .as_ref()
                    .map(|g| geojson::Geometry::new(geojson::Value::from(g))),
                id: None,
                properties: Some(f.properties.clone()),
                foreign_members: None,
            })
            .collect();

        let mut foreign = JsonObject::new();
        if let Some(name) = layer_name.or(self.name.as_deref()) {
            foreign.insert("name".to_string(), json!(name));
        }
        if self.epsg != EPSG_WGS84 {
            foreign.insert(
                "crs".to_string(),
                json!({
                    "type": "name",
                    "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", self.epsg) }
                }),
            );
        }

        FeatureCollection {
            bbox: None,
            features,
            foreign_members: if foreign.is_empty() { None } else { Some(foreign) },
        }
    }

    /// Save to a GeoJSON file, creating parent directories
    pub fn write<P: AsRef<Path>>(&self, path: P, layer_name: Option<&str>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let fc = self.to_feature_collection(layer_name);
        fs::write(path, GeoJson::FeatureCollection(fc).to_string())
            .with_context(|| format!("Failed to write GeoJSON file: {}", path.display()))?;

        info!("Saved {} features to {}", self.len(), path.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Keep rows matching the expression
    pub fn filter(&mut self, expr: &Expr) {
        self.features.retain(|f| expr.eval(&f.properties));
    }

    pub fn filter_str(&mut self, expr: &str) -> Result<()> {
        let expr = Expr::parse(expr).with_context(|| format!("Invalid filter: {}", expr))?;
        self.filter(&expr);
        Ok(())
    }

    pub fn retain<F: FnMut(&LayerFeature) -> bool>(&mut self, f: F) {
        self.features.retain(f);
    }

    /// Every property name, in first-seen order
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for feature in &self.features {
            for key in feature.properties.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        }
        names
    }

    /// Give every feature the same columns in the same order, missing values as null
    pub fn align_columns(&mut self) {
        let names = self.column_names();
        for feature in &mut self.features {
            let mut aligned = Map::with_capacity(names.len());
            for name in &names {
                let value = feature.properties.remove(name).unwrap_or(Value::Null);
                aligned.insert(name.clone(), value);
            }
            feature.properties = aligned;
        }
    }

    pub fn require_column(&self, column: &str) -> Result<(), Error> {
        if self.features.is_empty() || self.features.iter().any(|f| f.properties.contains_key(column))
        {
            Ok(())
        } else {
            Err(Error::MissingColumn(column.to_string()))
        }
    }

    /// Bounds of every geometry in the layer (minx, miny, maxx, maxy)
    pub fn total_bounds(&self) -> Option<BoundingBox> {
        self.features
            .iter()
            .filter_map(|f| f.geometry.as_ref())
            .filter_map(|g| g.bounding_rect())
            .map(BoundingBox::from_rect)
            .reduce(|a, b| a.union(&b))
    }

    /// Reproject every geometry to another CRS
    pub fn to_crs(mut self, epsg: i32) -> Result<Self> {
        let reprojector = Reprojector::new(self.epsg, epsg)?;
        if !reprojector.is_identity() {
            for feature in &mut self.features {
                if let Some(g) = feature.geometry.as_ref() {
                    feature.geometry = Some(reprojector.transform_geometry(g)?);
                }
            }
            debug!("Reprojected {} features EPSG:{} -> EPSG:{}", self.len(), self.epsg, epsg);
        }
        self.epsg = epsg;
        Ok(self)
    }

    /// One row per part of every multi-part geometry
    pub fn explode(self) -> Self {
        let mut features = Vec::with_capacity(self.features.len());
        for feature in self.features {
            match feature.geometry {
                Some(g) => {
                    let parts = explode_geometry(g);
                    for part in parts {
                        features.push(LayerFeature::new(Some(part), feature.properties.clone()));
                    }
                }
                None => features.push(feature),
            }
        }
        FeatureLayer {
            name: self.name,
            epsg: self.epsg,
            features,
        }
    }

    /// Render date/time columns as text
    pub fn stringify_columns(&mut self, columns: &[&str]) {
        for feature in &mut self.features {
            for column in columns {
                if let Some(value) = feature.properties.get_mut(*column) {
                    *value = process_datetime(value);
                }
            }
        }
    }

    /// Attribute table as a polars DataFrame of text columns
    #[cfg(feature = "polars")]
    pub fn to_polars_df(&self) -> Result<polars::prelude::DataFrame> {
        use crate::commons::basic_functions::value_as_text;
        use polars::prelude::*;

        let columns: Vec<Column> = self
            .column_names()
            .iter()
            .map(|name| {
                let values: Vec<Option<String>> = self
                    .features
                    .iter()
                    .map(|f| match f.properties.get(name) {
                        None | Some(Value::Null) => None,
                        Some(v) => Some(value_as_text(v)),
                    })
                    .collect();
                Column::new(name.as_str().into(), values)
            })
            .collect();

        DataFrame::new(columns).context("Failed to create DataFrame")
    }
}

fn explode_geometry(geometry: Geometry<f64>) -> Vec<Geometry<f64>> {
    match geometry {
        Geometry::MultiPolygon(mp) => mp.0.into_iter().map(Geometry::Polygon).collect(),
        Geometry::MultiLineString(mls) => mls.0.into_iter().map(Geometry::LineString).collect(),
        Geometry::MultiPoint(mp) => mp.0.into_iter().map(Geometry::Point).collect(),
        Geometry::GeometryCollection(gc) => gc.0.into_iter().flat_map(explode_geometry).collect(),
        other => vec![other],
    }
}

/// EPSG code from a legacy GeoJSON `crs` member
fn parse_crs_member(crs: &Value) -> Option<i32> {
    let name = crs.get("properties")?.get("name")?.as_str()?;
    parse_crs_name(name)
}

pub(crate) fn parse_crs_name(name: &str) -> Option<i32> {
    if name.ends_with("CRS84") {
        return Some(EPSG_WGS84);
    }
    name.rsplit(':').next()?.trim().parse().ok()
}

#[cfg(feature = "gdal")]
fn convert_to_geojson(path: &Path, layer: Option<&str>) -> Result<String> {
    use gdal::Dataset;
    use std::process::Command;
    use std::time::{SystemTime, UNIX_EPOCH};

    // Fail early with GDAL's own message when the source cannot be opened
    let _dataset = Dataset::open(path)
        .with_context(|| format!("Failed to open vector dataset: {}", path.display()))?;

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_geojson = std::env::temp_dir().join(format!("parcelsite_{}.geojson", stamp));

    let mut command = Command::new("ogr2ogr");
    command.arg("-f").arg("GeoJSON").arg(&temp_geojson).arg(path);
    if let Some(layer) = layer {
        command.arg(layer);
    }
    let status = command
        .status()
        .context("Failed to execute ogr2ogr. Make sure GDAL is installed and ogr2ogr is in PATH")?;

    if !status.success() {
        anyhow::bail!("ogr2ogr failed to convert {} to GeoJSON", path.display());
    }

    let text = fs::read_to_string(&temp_geojson).context("Failed to read temporary GeoJSON file")?;
    let _ = fs::remove_file(&temp_geojson);
    Ok(text)
}

#[cfg(not(feature = "gdal"))]
fn convert_to_geojson(path: &Path, _layer: Option<&str>) -> Result<String> {
    Err(Error::UnsupportedFormat(format!(
        "{} (only GeoJSON is read without the `gdal` feature)",
        path.display()
    ))
    .into())
}
