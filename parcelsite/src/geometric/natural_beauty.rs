use anyhow::{Context, Result};
use geo::MultiPolygon;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

use crate::collect::global_variables::EPSG_BRITISH_NATIONAL_GRID;
use crate::collect::layer::FeatureLayer;
use crate::commons::geometry::{to_multi_polygon, union_all};

/// Areas of Outstanding Natural Beauty, excluded from siting
pub struct NaturalBeauty {
    layer: FeatureLayer,
    union: OnceLock<MultiPolygon<f64>>,
}

impl NaturalBeauty {
    /// Read the areas and reproject them to `target_epsg` (British National Grid when None)
    pub fn read<P: AsRef<Path>>(path: P, target_epsg: Option<i32>) -> Result<Self> {
        let path = path.as_ref();
        let layer = FeatureLayer::read(path, None, None, None)
            .with_context(|| format!("Failed to read AONB from {}", path.display()))?;
        let layer = layer
            .to_crs(target_epsg.unwrap_or(EPSG_BRITISH_NATIONAL_GRID))
            .context("Failed to reproject AONB")?;
        info!("{} natural beauty areas loaded", layer.len());
        Ok(Self::from_layer(layer))
    }

    pub fn from_layer(layer: FeatureLayer) -> Self {
        NaturalBeauty {
            layer,
            union: OnceLock::new(),
        }
    }

    pub fn get_layer(&self) -> &FeatureLayer {
        &self.layer
    }

    pub fn epsg(&self) -> i32 {
        self.layer.epsg
    }

    /// Dissolved exclusion zone, computed once
    pub fn union(&self) -> &MultiPolygon<f64> {
        self.union.get_or_init(|| {
            union_all(
                self.layer
                    .features
                    .iter()
                    .filter_map(|f| f.geometry.as_ref())
                    .filter_map(to_multi_polygon)
                    .collect(),
            )
        })
    }
}
