use anyhow::{Context, Result};
use geo::MultiPolygon;
use std::path::Path;
use tracing::info;

use crate::collect::layer::FeatureLayer;
use crate::commons::geometry::{to_multi_polygon, union_all};

/// Ward boundaries layer of the ONS May 2024 release
pub const DEFAULT_WARD_LAYER: &str = "WD_MAY_2024_UK_BFC";
/// Target wards: every ward of the extract except Loddon & Chedgrave
pub const DEFAULT_WARD_FILTER: &str = "WD24NM != 'Loddon & Chedgrave'";

/// Administrative wards used as the geographic filter of the study
pub struct Wards {
    layer: FeatureLayer,
}

impl Wards {
    pub fn read<P: AsRef<Path>>(
        path: P,
        layer: Option<&str>,
        where_clause: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let layer = FeatureLayer::read(path, layer, where_clause, None)
            .with_context(|| format!("Failed to read wards from {}", path.display()))?;
        Self::from_layer(layer)
    }

    /// Zero wards leave nothing for a parcel to fall within, which is an error
    pub fn from_layer(layer: FeatureLayer) -> Result<Self> {
        if layer.is_empty() {
            anyhow::bail!("No wards left after filtering");
        }
        info!("{} wards selected", layer.len());
        Ok(Wards { layer })
    }

    pub fn len(&self) -> usize {
        self.layer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layer.is_empty()
    }

    pub fn epsg(&self) -> i32 {
        self.layer.epsg
    }

    /// Reproject the ward boundaries (e.g. to the parcels' CRS)
    pub fn to_crs(self, epsg: i32) -> Result<Self> {
        Ok(Wards {
            layer: self.layer.to_crs(epsg)?,
        })
    }

    pub fn get_layer(&self) -> &FeatureLayer {
        &self.layer
    }

    /// All ward polygons merged into one geometry
    pub fn union_all(&self) -> MultiPolygon<f64> {
        let polygons = self
            .layer
            .features
            .iter()
            .filter_map(|f| f.geometry.as_ref())
            .filter_map(to_multi_polygon)
            .collect();
        union_all(polygons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::layer::LayerFeature;
    use geo::{polygon, Area, Geometry};
    use serde_json::{json, Map};

    fn ward(name: &str, polygon: geo::Polygon<f64>) -> LayerFeature {
        let mut props = Map::new();
        props.insert("WD24NM".into(), json!(name));
        LayerFeature::new(Some(Geometry::Polygon(polygon)), props)
    }

    fn sample_layer() -> FeatureLayer {
        FeatureLayer::with_features(
            Some(DEFAULT_WARD_LAYER.to_string()),
            27700,
            vec![
                ward(
                    "Thurton",
                    polygon![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0), (x: 100.0, y: 100.0), (x: 0.0, y: 100.0), (x: 0.0, y: 0.0)],
                ),
                ward(
                    "Rockland",
                    polygon![(x: 100.0, y: 0.0), (x: 200.0, y: 0.0), (x: 200.0, y: 100.0), (x: 100.0, y: 100.0), (x: 100.0, y: 0.0)],
                ),
                ward(
                    "Loddon & Chedgrave",
                    polygon![(x: 500.0, y: 500.0), (x: 600.0, y: 500.0), (x: 600.0, y: 600.0), (x: 500.0, y: 600.0), (x: 500.0, y: 500.0)],
                ),
            ],
        )
    }

    #[test]
    fn test_union_of_filtered_wards() {
        let mut layer = sample_layer();
        layer.filter_str(DEFAULT_WARD_FILTER).unwrap();
        let wards = Wards::from_layer(layer).unwrap();
        assert_eq!(wards.len(), 2);

        let union = wards.union_all();
        assert!((union.unsigned_area() - 20_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_wards_is_an_error() {
        let mut layer = sample_layer();
        layer.filter_str("WD24NM == 'Nowhere'").unwrap();
        assert!(Wards::from_layer(layer).is_err());
    }
}
