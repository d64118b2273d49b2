use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::collect::global_variables::{
    OUTPUT_PATH, PARCELS_LAYER, PARCEL_TITLE_FIELD, TITLE_NUMBER_FIELD,
};
use crate::collect::layer::FeatureLayer;
use crate::collect::registry::{
    CompanyRegistry, RegistryScan, DEFAULT_REGISTRY_FIELDS, DEFAULT_REGISTRY_FILTER,
    DOMESTIC_PREFIX, FOREIGN_PREFIX,
};
use crate::commons::basic_functions::value_as_text;
use crate::commons::filter::Expr;
use crate::commons::geometry::{is_valid, make_valid, normalize};
use crate::geo_core::GeoCore;

/// Step 2: attach UK (CCOD) and overseas (OCOD) company ownership to the parcels
pub struct OwnershipJoin {
    parcels_path: PathBuf,
    ccod_path: PathBuf,
    ocod_path: PathBuf,
    /// Output directory for processed data
    output_path: PathBuf,
    pub geo_core: GeoCore,
    parcels_layer: Option<String>,
    registry_filter: Option<String>,
    fields: Vec<String>,
    encoding: Option<String>,
    layer: Option<FeatureLayer>,
}

impl OwnershipJoin {
    pub fn new(
        parcels_path: impl Into<PathBuf>,
        ccod_path: impl Into<PathBuf>,
        ocod_path: impl Into<PathBuf>,
        output_path: Option<String>,
    ) -> Result<Self> {
        let output_path_buf = PathBuf::from(output_path.as_deref().unwrap_or(OUTPUT_PATH));
        let mut geo_core = GeoCore::default();
        geo_core.set_output_path(Some(output_path_buf.to_string_lossy().to_string()));

        Ok(OwnershipJoin {
            parcels_path: parcels_path.into(),
            ccod_path: ccod_path.into(),
            ocod_path: ocod_path.into(),
            output_path: output_path_buf,
            geo_core,
            parcels_layer: Some(PARCELS_LAYER.to_string()),
            registry_filter: Some(DEFAULT_REGISTRY_FILTER.to_string()),
            fields: DEFAULT_REGISTRY_FIELDS.iter().map(|f| f.to_string()).collect(),
            encoding: None,
            layer: None,
        })
    }

    pub fn set_parcels_layer(&mut self, layer: Option<String>) {
        self.parcels_layer = layer;
    }

    /// Row filter applied to both registries, None keeps every row
    pub fn set_registry_filter(&mut self, filter: Option<String>) {
        self.registry_filter = filter;
    }

    /// Registry columns carried onto the parcels; must include `Title Number`
    pub fn set_fields(&mut self, fields: Vec<String>) {
        self.fields = fields;
    }

    pub fn set_encoding(&mut self, encoding: Option<String>) {
        self.encoding = encoding;
    }

    pub fn run(mut self) -> Result<Self> {
        self.run_internal()?;
        Ok(self)
    }

    pub fn run_internal(&mut self) -> Result<()> {
        let domestic = self
            .prepare_registry(&self.ccod_path, DOMESTIC_PREFIX)
            .context("Failed to prepare CCOD")?;
        let foreign = self
            .prepare_registry(&self.ocod_path, FOREIGN_PREFIX)
            .context("Failed to prepare OCOD")?;

        let mut parcels = FeatureLayer::read(&self.parcels_path, self.parcels_layer.as_deref(), None, None)
            .context("Failed to read parcels")?;
        self.geo_core.set_epsg(parcels.epsg);

        repair_geometries(&mut parcels);
        join_registry(&mut parcels, &domestic, PARCEL_TITLE_FIELD, DOMESTIC_PREFIX)?;
        join_registry(&mut parcels, &foreign, PARCEL_TITLE_FIELD, FOREIGN_PREFIX)?;
        parcels.align_columns();

        self.geo_core.set_bbox(parcels.total_bounds());
        self.layer = Some(parcels);
        Ok(())
    }

    fn prepare_registry(&self, path: &Path, prefix: &str) -> Result<CompanyRegistry> {
        let filter = self
            .registry_filter
            .as_deref()
            .map(|f| Expr::parse(f).with_context(|| format!("Invalid registry filter: {}", f)))
            .transpose()?;
        let scan = RegistryScan {
            filter,
            fields: Some(self.fields.clone()),
        };
        let mut registry = CompanyRegistry::read_with(path, self.encoding.as_deref(), &scan)?;
        registry.add_prefix(prefix);
        info!("{} rows of {} kept for the join", registry.len(), path.display());
        Ok(registry)
    }

    pub fn get_layer(&self) -> Option<&FeatureLayer> {
        self.layer.as_ref()
    }

    pub fn into_layer(self) -> Option<FeatureLayer> {
        self.layer
    }

    /// Save to `<output_path>/<name>.geojson` as the `parcels` layer
    pub fn to_geojson(&self, name: Option<&str>) -> Result<PathBuf> {
        let layer = self
            .layer
            .as_ref()
            .context("No parcels available. Call run() first.")?;
        let output_file = self
            .output_path
            .join(format!("{}.geojson", name.unwrap_or("NSD_joined")));
        layer.write(&output_file, Some(PARCELS_LAYER))?;
        Ok(output_file)
    }

    pub fn get_output_path(&self) -> &Path {
        &self.output_path
    }
}

/// Normalize every geometry and repair the invalid ones
pub fn repair_geometries(layer: &mut FeatureLayer) {
    let mut repaired = 0usize;
    for feature in &mut layer.features {
        if let Some(geometry) = feature.geometry.as_ref() {
            let normalized = normalize(geometry);
            feature.geometry = Some(if is_valid(&normalized) {
                normalized
            } else {
                repaired += 1;
                make_valid(&normalized)
            });
        }
    }
    if repaired > 0 {
        info!("Repaired {} invalid parcel geometries", repaired);
    }
}

/// Many-to-one left join of a prefixed registry onto the layer.
/// `left_on` is matched against `<prefix>Title Number`; unmatched features get
/// null in every registry column.
pub fn join_registry(
    layer: &mut FeatureLayer,
    registry: &CompanyRegistry,
    left_on: &str,
    prefix: &str,
) -> Result<()> {
    let right_on = format!("{}{}", prefix, TITLE_NUMBER_FIELD);
    let index = registry.index_by(&right_on)?;

    let mut matched = 0usize;
    for feature in &mut layer.features {
        let row = match feature.get(left_on) {
            None | Some(Value::Null) => None,
            Some(key) => index.get(&value_as_text(key)).copied(),
        };
        match row {
            Some(row) => {
                matched += 1;
                for column in &registry.columns {
                    let value = row.get(column).cloned().unwrap_or(Value::Null);
                    feature.properties.insert(column.clone(), value);
                }
            }
            None => {
                for column in &registry.columns {
                    feature.properties.insert(column.clone(), Value::Null);
                }
            }
        }
    }

    debug!("{} matched {} of {} parcels", right_on, matched, layer.len());
    Ok(())
}
