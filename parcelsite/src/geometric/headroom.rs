use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

use crate::collect::layer::{FeatureLayer, LayerFeature};
use crate::commons::basic_functions::{is_null, value_as_text};
use crate::commons::geometry::{geometry_key, is_empty, normalize};

/// Layer of the DFES network headroom report
pub const DEFAULT_HEADROOM_LAYER: &str = "dfes-network-headroom-report";
pub const DEFAULT_HEADROOM_FILTER: &str = "category = 'Demand Headroom'";

pub const SUPPLY_POINT_FIELD: &str = "gridsupplypoint";
pub const HEADROOM_FIELD: &str = "headroom";

/// Grid headroom areas per grid supply point
pub struct Headroom {
    layer: FeatureLayer,
}

impl Headroom {
    pub fn read<P: AsRef<Path>>(
        path: P,
        layer: Option<&str>,
        where_clause: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let layer = FeatureLayer::read(path, layer, where_clause, None)
            .with_context(|| format!("Failed to read grid headroom from {}", path.display()))?;
        Ok(Headroom { layer })
    }

    pub fn from_layer(layer: FeatureLayer) -> Self {
        Headroom { layer }
    }

    pub fn get_layer(&self) -> &FeatureLayer {
        &self.layer
    }

    /// One feature per distinct geometry, restricted to supply points whose
    /// summed headroom is positive
    pub fn prepare(self) -> Result<FeatureLayer> {
        let mut layer = self.layer;
        let total = layer.len();

        for feature in &mut layer.features {
            if let Some(g) = feature.geometry.as_ref() {
                feature.geometry = Some(normalize(g));
            }
        }

        let positive = positive_supply_points(&layer);

        layer.retain(|f| f.geometry.as_ref().map(|g| !is_empty(g)).unwrap_or(false));

        let mut grouped = group_by_geometry(layer);
        grouped.retain(|f| match f.get(SUPPLY_POINT_FIELD) {
            None | Some(Value::Null) => false,
            Some(v) => positive.contains(&value_as_text(v)),
        });

        info!(
            "{} headroom areas kept out of {} features ({} supply points with positive headroom)",
            grouped.len(),
            total,
            positive.len()
        );
        Ok(grouped)
    }
}

/// Supply points whose summed headroom is strictly positive.
/// Null headroom is skipped; non-numeric text counts as zero.
pub fn positive_supply_points(layer: &FeatureLayer) -> HashSet<String> {
    let mut order: Vec<String> = Vec::new();
    let mut sums: HashMap<String, f64> = HashMap::new();

    for feature in &layer.features {
        let point = match feature.get(SUPPLY_POINT_FIELD) {
            None | Some(Value::Null) => continue,
            Some(v) => value_as_text(v),
        };
        let value = headroom_value(feature.get(HEADROOM_FIELD), &point);
        if !sums.contains_key(&point) {
            order.push(point.clone());
        }
        *sums.entry(point).or_insert(0.0) += value;
    }

    order
        .into_iter()
        .filter(|p| sums.get(p).map(|s| *s > 0.0).unwrap_or(false))
        .collect()
}

fn headroom_value(value: Option<&Value>, supply_point: &str) -> f64 {
    match value {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) => v,
            Err(_) => {
                warn!("Non-numeric headroom '{}' at {} counted as 0", s, supply_point);
                0.0
            }
        },
        Some(other) => {
            warn!("Non-numeric headroom {} at {} counted as 0", other, supply_point);
            0.0
        }
    }
}

/// Collapse features sharing the same (normalized) geometry, keeping per column
/// the first non-null value. Groups come out in first-appearance order.
pub fn group_by_geometry(layer: FeatureLayer) -> FeatureLayer {
    let columns = layer.column_names();
    let FeatureLayer {
        name,
        epsg,
        features,
    } = layer;

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<LayerFeature> = Vec::new();

    for feature in features {
        let key = match feature.geometry.as_ref() {
            Some(g) => geometry_key(g),
            None => continue,
        };
        match index.get(&key) {
            Some(&i) => {
                let group = &mut groups[i];
                for (column, value) in feature.properties {
                    if is_null(group.properties.get(&column)) && !value.is_null() {
                        group.properties.insert(column, value);
                    }
                }
            }
            None => {
                index.insert(key, groups.len());
                groups.push(feature);
            }
        }
    }

    for group in &mut groups {
        let mut aligned = Map::with_capacity(columns.len());
        for column in &columns {
            let value = group.properties.remove(column).unwrap_or(Value::Null);
            aligned.insert(column.clone(), value);
        }
        group.properties = aligned;
    }

    FeatureLayer::with_features(name, epsg, groups)
}
