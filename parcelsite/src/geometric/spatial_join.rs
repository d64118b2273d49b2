use anyhow::Result;
use geo::{BooleanOps, BoundingRect, Geometry, MultiPolygon, Polygon, Rect};
use rstar::{Envelope, RTree, RTreeObject, AABB};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::collect::layer::{FeatureLayer, LayerFeature};
use crate::commons::geometry::{area, from_multi_polygon, min_distance, to_multi_polygon, union_all};

#[cfg(feature = "indicatif")]
fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {percent} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

#[cfg(feature = "indicatif")]
fn progress_bar(len: usize, message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(progress_style());
    pb.set_message(message);
    pb
}

/// Bounding rectangle of one right-hand feature in the R-tree
struct IndexedBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope(rect: Rect<f64>, pad: f64) -> AABB<[f64; 2]> {
    AABB::from_corners(
        [rect.min().x - pad, rect.min().y - pad],
        [rect.max().x + pad, rect.max().y + pad],
    )
}

fn build_index(layer: &FeatureLayer) -> RTree<IndexedBox> {
    let boxes = layer
        .features
        .iter()
        .enumerate()
        .filter_map(|(idx, f)| {
            let rect = f.geometry.as_ref()?.bounding_rect()?;
            Some(IndexedBox {
                idx,
                env: envelope(rect, 0.0),
            })
        })
        .collect();
    RTree::bulk_load(boxes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinHow {
    /// Keep every left row, unmatched ones with null right columns
    Left,
    /// Keep matched left rows only
    Inner,
}

#[derive(Debug, Clone)]
pub struct NearestJoinOptions {
    /// Search radius in layer units, unbounded when None
    pub max_distance: Option<f64>,
    /// Column receiving the distance, omitted when None
    pub distance_col: Option<String>,
    pub lsuffix: String,
    pub rsuffix: String,
    pub how: JoinHow,
}

impl Default for NearestJoinOptions {
    fn default() -> Self {
        NearestJoinOptions {
            max_distance: None,
            distance_col: Some("dist".to_string()),
            lsuffix: "left".to_string(),
            rsuffix: "right".to_string(),
            how: JoinHow::Left,
        }
    }
}

/// Right features at the minimum distance from `geometry` (ties all kept)
fn nearest_matches(
    geometry: &Geometry<f64>,
    right: &FeatureLayer,
    tree: &RTree<IndexedBox>,
    max_distance: Option<f64>,
) -> Vec<(usize, f64)> {
    let Some(rect) = geometry.bounding_rect() else {
        return Vec::new();
    };
    if tree.size() == 0 {
        return Vec::new();
    }

    let tree_env = tree.root().envelope();
    let mut radius = match max_distance {
        Some(d) => d,
        None => (rect.width().max(rect.height())).max(1.0),
    };

    loop {
        let search = envelope(rect, radius);
        let mut candidates: Vec<(usize, f64)> = tree
            .locate_in_envelope_intersecting(&search)
            .filter_map(|b| {
                let other = right.features[b.idx].geometry.as_ref()?;
                min_distance(geometry, other).map(|d| (b.idx, d))
            })
            .collect();

        let best = candidates.iter().map(|(_, d)| *d).fold(f64::INFINITY, f64::min);
        // Everything farther than `radius` is outside the searched envelope, so a
        // best distance within it is the global minimum
        let settled = best <= radius
            || max_distance.is_some()
            || search.contains_envelope(&tree_env);

        if settled {
            if let Some(limit) = max_distance {
                candidates.retain(|(_, d)| *d <= limit);
            }
            candidates.retain(|(_, d)| *d == best);
            candidates.sort_by_key(|(idx, _)| *idx);
            return candidates;
        }
        radius *= 2.0;
    }
}

fn has_column(columns: &[String], column: &str) -> bool {
    columns.iter().any(|c| c == column)
}

fn suffixed(column: &str, suffix: &str) -> String {
    format!("{}_{}", column, suffix)
}

/// Join each left feature to its nearest right feature(s).
///
/// Left geometries are kept. Columns present on both sides are renamed
/// `{col}_{lsuffix}` / `{col}_{rsuffix}`, the right row number goes to
/// `index_{rsuffix}` and the distance to `distance_col`. Both layers must share
/// a projected CRS.
pub fn sjoin_nearest(
    left: &FeatureLayer,
    right: &FeatureLayer,
    options: &NearestJoinOptions,
) -> Result<FeatureLayer> {
    if left.epsg != right.epsg {
        anyhow::bail!(
            "CRS mismatch in nearest join: EPSG:{} vs EPSG:{}",
            left.epsg,
            right.epsg
        );
    }

    let tree = build_index(right);
    let left_columns = left.column_names();
    let right_columns = right.column_names();
    let index_col = suffixed("index", &options.rsuffix);

    #[cfg(feature = "indicatif")]
    let pb = progress_bar(left.len(), "Nearest join");

    let search = |feature: &LayerFeature| -> Vec<(usize, f64)> {
        let found = match feature.geometry.as_ref() {
            Some(g) => nearest_matches(g, right, &tree, options.max_distance),
            None => Vec::new(),
        };
        #[cfg(feature = "indicatif")]
        pb.inc(1);
        found
    };

    #[cfg(feature = "rayon")]
    let matches: Vec<Vec<(usize, f64)>> = left.features.par_iter().map(search).collect();
    #[cfg(not(feature = "rayon"))]
    let matches: Vec<Vec<(usize, f64)>> = left.features.iter().map(search).collect();

    #[cfg(feature = "indicatif")]
    pb.finish_and_clear();

    let left_row = |feature: &LayerFeature| -> Map<String, Value> {
        let mut row = Map::new();
        for column in &left_columns {
            let name = if has_column(&right_columns, column) {
                suffixed(column, &options.lsuffix)
            } else {
                column.clone()
            };
            let value = feature.properties.get(column).cloned().unwrap_or(Value::Null);
            row.insert(name, value);
        }
        row
    };
    let right_names: Vec<String> = right_columns
        .iter()
        .map(|c| {
            if has_column(&left_columns, c) {
                suffixed(c, &options.rsuffix)
            } else {
                c.clone()
            }
        })
        .collect();

    let mut features = Vec::with_capacity(left.len());
    let mut matched = 0usize;
    for (feature, found) in left.features.iter().zip(matches) {
        if found.is_empty() {
            if options.how == JoinHow::Inner {
                continue;
            }
            let mut row = left_row(feature);
            row.insert(index_col.clone(), Value::Null);
            for name in &right_names {
                row.insert(name.clone(), Value::Null);
            }
            if let Some(col) = options.distance_col.as_ref() {
                row.insert(col.clone(), Value::Null);
            }
            features.push(LayerFeature::new(feature.geometry.clone(), row));
            continue;
        }

        matched += 1;
        for (idx, distance) in found {
            let other = &right.features[idx];
            let mut row = left_row(feature);
            row.insert(index_col.clone(), json!(idx));
            for (column, name) in right_columns.iter().zip(&right_names) {
                let value = other.properties.get(column).cloned().unwrap_or(Value::Null);
                row.insert(name.clone(), value);
            }
            if let Some(col) = options.distance_col.as_ref() {
                row.insert(col.clone(), json!(distance));
            }
            features.push(LayerFeature::new(feature.geometry.clone(), row));
        }
    }

    info!(
        "Nearest join matched {} of {} features ({} rows)",
        matched,
        left.len(),
        features.len()
    );
    Ok(FeatureLayer::with_features(left.name.clone(), left.epsg, features))
}

/// Remove the parts of each feature covered by the mask layer. Only polygonal
/// features are kept and those left empty are dropped; attributes come from
/// `layer` alone.
pub fn overlay_difference(layer: &FeatureLayer, mask: &FeatureLayer) -> Result<FeatureLayer> {
    if layer.epsg != mask.epsg {
        anyhow::bail!(
            "CRS mismatch in overlay: EPSG:{} vs EPSG:{}",
            layer.epsg,
            mask.epsg
        );
    }
    let dissolved = union_all(
        mask.features
            .iter()
            .filter_map(|f| f.geometry.as_ref())
            .filter_map(to_multi_polygon)
            .collect(),
    );
    Ok(subtract_mask(layer, &dissolved))
}

/// Same as [`overlay_difference`] against an already dissolved mask in the
/// layer's CRS. The mask parts are disjoint, so each feature is differenced
/// with the parts touching its bounds without any further union.
pub fn subtract_mask(layer: &FeatureLayer, mask: &MultiPolygon<f64>) -> FeatureLayer {
    let boxes = mask
        .0
        .iter()
        .enumerate()
        .filter_map(|(idx, p)| {
            Some(IndexedBox {
                idx,
                env: envelope(p.bounding_rect()?, 0.0),
            })
        })
        .collect();
    let tree: RTree<IndexedBox> = RTree::bulk_load(boxes);

    #[cfg(feature = "indicatif")]
    let pb = progress_bar(layer.len(), "Overlay difference");

    let subtract = |feature: &LayerFeature| -> Option<LayerFeature> {
        let remainder = feature
            .geometry
            .as_ref()
            .and_then(to_multi_polygon)
            .and_then(|polygons| {
                let rect = polygons.bounding_rect()?;
                let overlapping: Vec<Polygon<f64>> = tree
                    .locate_in_envelope_intersecting(&envelope(rect, 0.0))
                    .map(|b| mask.0[b.idx].clone())
                    .collect();
                let rest = if overlapping.is_empty() {
                    polygons
                } else {
                    polygons.difference(&MultiPolygon::new(overlapping))
                };
                let rest = from_multi_polygon(rest);
                (area(&rest) > 0.0).then_some(rest)
            });
        #[cfg(feature = "indicatif")]
        pb.inc(1);
        remainder.map(|g| LayerFeature::new(Some(g), feature.properties.clone()))
    };

    #[cfg(feature = "rayon")]
    let kept: Vec<Option<LayerFeature>> = layer.features.par_iter().map(subtract).collect();
    #[cfg(not(feature = "rayon"))]
    let kept: Vec<Option<LayerFeature>> = layer.features.iter().map(subtract).collect();

    #[cfg(feature = "indicatif")]
    pb.finish_and_clear();

    let features: Vec<LayerFeature> = kept.into_iter().flatten().collect();
    debug!(
        "Overlay difference kept {} of {} features",
        features.len(),
        layer.len()
    );
    FeatureLayer::with_features(layer.name.clone(), layer.epsg, features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon, Area};

    fn square(x: f64, y: f64, side: f64) -> Geometry<f64> {
        Geometry::Polygon(polygon![
            (x: x, y: y),
            (x: x + side, y: y),
            (x: x + side, y: y + side),
            (x: x, y: y + side),
            (x: x, y: y),
        ])
    }

    fn feature(geometry: Geometry<f64>, props: Value) -> LayerFeature {
        let properties = match props {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        LayerFeature::new(Some(geometry), properties)
    }

    fn parcels() -> FeatureLayer {
        FeatureLayer::with_features(
            None,
            27700,
            vec![
                feature(square(0.0, 0.0, 10.0), json!({"TITLE_NO": "NK1", "name": "near"})),
                feature(square(10_000.0, 0.0, 10.0), json!({"TITLE_NO": "NK2", "name": "far"})),
                feature(square(100.0, 100.0, 10.0), json!({"TITLE_NO": "NK3", "name": "tie"})),
            ],
        )
    }

    fn headroom() -> FeatureLayer {
        FeatureLayer::with_features(
            None,
            27700,
            vec![
                feature(Geometry::Point(point!(x: 20.0, y: 5.0)), json!({"gridsupplypoint": "A", "name": "a"})),
                feature(Geometry::Point(point!(x: 90.0, y: 105.0)), json!({"gridsupplypoint": "B", "name": "b"})),
                feature(Geometry::Point(point!(x: 120.0, y: 105.0)), json!({"gridsupplypoint": "C", "name": "c"})),
            ],
        )
    }

    #[test]
    fn test_nearest_left_join_with_max_distance() {
        let options = NearestJoinOptions {
            max_distance: Some(3000.0),
            lsuffix: String::new(),
            rsuffix: "_".to_string(),
            ..NearestJoinOptions::default()
        };
        let joined = sjoin_nearest(&parcels(), &headroom(), &options).unwrap();

        // NK1 -> A, NK2 unmatched, NK3 ties between B and C
        assert_eq!(joined.len(), 4);
        let first = &joined.features[0];
        assert_eq!(first.get("gridsupplypoint"), Some(&json!("A")));
        assert_eq!(first.get("dist"), Some(&json!(10.0)));
        assert_eq!(first.get("index__"), Some(&json!(0)));
        assert_eq!(first.get("name_"), Some(&json!("near")));
        assert_eq!(first.get("name__"), Some(&json!("a")));
        assert_eq!(first.get("TITLE_NO"), Some(&json!("NK1")));

        let unmatched = &joined.features[1];
        assert_eq!(unmatched.get("TITLE_NO"), Some(&json!("NK2")));
        assert_eq!(unmatched.get("dist"), Some(&Value::Null));
        assert_eq!(unmatched.get("gridsupplypoint"), Some(&Value::Null));

        let ties: Vec<&Value> = joined.features[2..]
            .iter()
            .filter_map(|f| f.get("gridsupplypoint"))
            .collect();
        assert_eq!(ties, vec![&json!("B"), &json!("C")]);
    }

    #[test]
    fn test_nearest_inner_without_limit() {
        let options = NearestJoinOptions {
            how: JoinHow::Inner,
            ..NearestJoinOptions::default()
        };
        let joined = sjoin_nearest(&parcels(), &headroom(), &options).unwrap();
        assert_eq!(joined.len(), 4);
        // The far parcel still finds its nearest supply point
        let far = &joined.features[1];
        assert_eq!(far.get("name_left"), Some(&json!("far")));
        assert_eq!(far.get("gridsupplypoint"), Some(&json!("C")));
        assert_eq!(far.get("index_right"), Some(&json!(2)));
    }

    #[test]
    fn test_nearest_join_crs_mismatch() {
        let mut other = headroom();
        other.epsg = 4326;
        assert!(sjoin_nearest(&parcels(), &other, &NearestJoinOptions::default()).is_err());
    }

    #[test]
    fn test_overlay_difference() {
        let mask = FeatureLayer::with_features(
            None,
            27700,
            vec![
                feature(square(5.0, -5.0, 20.0), json!({"name": "Norfolk Coast"})),
                feature(square(95.0, 95.0, 30.0), json!({"name": "Suffolk Coast"})),
            ],
        );
        let result = overlay_difference(&parcels(), &mask).unwrap();

        // NK3 is fully covered and dropped
        assert_eq!(result.len(), 2);
        assert_eq!(result.features[0].get("TITLE_NO"), Some(&json!("NK1")));
        assert!(result.features[0].get("name").is_some());
        let clipped = result.features[0].geometry.as_ref().unwrap();
        assert!((clipped.unsigned_area() - 50.0).abs() < 1e-6);
        assert!((result.features[1].geometry.as_ref().unwrap().unsigned_area() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_subtract_dissolved_mask() {
        // Two overlapping zones dissolved into one part
        let mask = MultiPolygon::new(vec![polygon![
            (x: 5.0, y: -5.0),
            (x: 30.0, y: -5.0),
            (x: 30.0, y: 20.0),
            (x: 5.0, y: 20.0),
            (x: 5.0, y: -5.0),
        ]]);
        let result = subtract_mask(&parcels(), &mask);
        assert_eq!(result.len(), 3);
        let clipped = result.features[0].geometry.as_ref().unwrap();
        assert!((clipped.unsigned_area() - 50.0).abs() < 1e-6);
        assert_eq!(result.features[2].get("TITLE_NO"), Some(&json!("NK3")));

        let untouched = subtract_mask(&parcels(), &MultiPolygon::new(vec![]));
        assert_eq!(untouched.len(), 3);
    }

    #[test]
    fn test_overlay_drops_non_polygons() {
        let layer = FeatureLayer::with_features(
            None,
            27700,
            vec![feature(Geometry::Point(point!(x: 1.0, y: 1.0)), json!({}))],
        );
        let mask = FeatureLayer::new(None, 27700);
        assert!(overlay_difference(&layer, &mask).unwrap().is_empty());
    }
}
