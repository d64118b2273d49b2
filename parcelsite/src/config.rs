//! Pipeline configuration.
//!
//! Every field has a default reproducing the Norwich study, so an empty YAML
//! document is a valid configuration. Relative data paths resolve against
//! `data_dir`, relative map and key paths against `solutions_dir`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::collect::global_variables::{get_data_path, SOLUTIONS_PATH};
use crate::collect::registry::{DEFAULT_REGISTRY_FIELDS, DEFAULT_REGISTRY_FILTER};
use crate::geometric::best_choice::{DEFAULT_MAX_DISTANCE, DEFAULT_TENURE_FILTER};
use crate::geometric::headroom::{DEFAULT_HEADROOM_FILTER, DEFAULT_HEADROOM_LAYER};
use crate::geometric::parcel::{DEFAULT_MIN_HECTARES, DEFAULT_PARCELS_LAYER};
use crate::geometric::parcel_map::DEFAULT_ZOOM_START;
use crate::geometric::ward::{DEFAULT_WARD_FILTER, DEFAULT_WARD_LAYER};
use crate::visual::leaflet::TileLayer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub solutions_dir: PathBuf,
    /// Directory of the intermediate parcel layers, under `data_dir` when relative
    pub refined_dir: PathBuf,
    pub subset: SubsetConfig,
    pub companies: CompaniesConfig,
    pub map: MapConfig,
    pub best_choice: BestChoiceConfig,
    pub geocode: GeocodeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsetConfig {
    pub parcels: PathBuf,
    pub parcels_layer: Option<String>,
    pub wards: PathBuf,
    pub ward_layer: Option<String>,
    pub ward_filter: Option<String>,
    pub min_hectares: f64,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompaniesConfig {
    pub ccod: PathBuf,
    pub ocod: PathBuf,
    /// CSV text encoding label, UTF-8 when unset
    pub encoding: Option<String>,
    pub registry_filter: Option<String>,
    pub fields: Vec<String>,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub output_html: PathBuf,
    pub zoom_start: Option<u8>,
    pub click_popup: bool,
    pub tiles: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BestChoiceConfig {
    pub headroom: PathBuf,
    pub headroom_layer: Option<String>,
    pub headroom_filter: Option<String>,
    pub aonb: PathBuf,
    /// Metres; no limit when unset
    pub max_distance: Option<f64>,
    pub tenure_filter: String,
    pub output_html: PathBuf,
    /// Optional GeoJSON export of the selection
    pub output_geojson: Option<PathBuf>,
    pub click_popup: bool,
    pub tiles: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    pub key_file: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            data_dir: get_data_path(),
            solutions_dir: PathBuf::from(SOLUTIONS_PATH),
            refined_dir: PathBuf::from("RefinedData"),
            subset: SubsetConfig::default(),
            companies: CompaniesConfig::default(),
            map: MapConfig::default(),
            best_choice: BestChoiceConfig::default(),
            geocode: GeocodeConfig::default(),
        }
    }
}

impl Default for SubsetConfig {
    fn default() -> Self {
        SubsetConfig {
            parcels: PathBuf::from("Cadastral Parcels/NSD_merged.geojson"),
            parcels_layer: Some(DEFAULT_PARCELS_LAYER.to_string()),
            wards: PathBuf::from("wards_cropped.geojson"),
            ward_layer: Some(DEFAULT_WARD_LAYER.to_string()),
            ward_filter: Some(DEFAULT_WARD_FILTER.to_string()),
            min_hectares: DEFAULT_MIN_HECTARES,
            output_name: "NSD_peeled".to_string(),
        }
    }
}

impl Default for CompaniesConfig {
    fn default() -> Self {
        CompaniesConfig {
            ccod: PathBuf::from("Companies that own land/CCOD.csv"),
            ocod: PathBuf::from("Companies that own land/OCOD.csv"),
            encoding: None,
            registry_filter: Some(DEFAULT_REGISTRY_FILTER.to_string()),
            fields: DEFAULT_REGISTRY_FIELDS.iter().map(|f| f.to_string()).collect(),
            output_name: "NSD_joined".to_string(),
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            output_html: PathBuf::from("3.map.folium.html"),
            zoom_start: Some(DEFAULT_ZOOM_START),
            click_popup: false,
            tiles: "cartodbpositron".to_string(),
        }
    }
}

impl Default for BestChoiceConfig {
    fn default() -> Self {
        BestChoiceConfig {
            headroom: PathBuf::from("generation_headroom_.geojson"),
            headroom_layer: Some(DEFAULT_HEADROOM_LAYER.to_string()),
            headroom_filter: Some(DEFAULT_HEADROOM_FILTER.to_string()),
            aonb: PathBuf::from("Areas_of_Outstanding_Natural_Beauty_England.json"),
            max_distance: Some(DEFAULT_MAX_DISTANCE),
            tenure_filter: DEFAULT_TENURE_FILTER.to_string(),
            output_html: PathBuf::from("4.map.folium.html"),
            output_geojson: None,
            click_popup: false,
            tiles: "cartodbpositron".to_string(),
        }
    }
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        GeocodeConfig {
            key_file: PathBuf::from("OS_DATA_HUB_API_KEY.txt"),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to a mapping
        if text.trim().is_empty() {
            return Ok(PipelineConfig::default());
        }
        serde_yaml::from_str(text).context("Failed to parse pipeline configuration")
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("In {}", path.display()))
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize pipeline configuration")
    }

    /// Path under `data_dir` (absolute paths are kept)
    pub fn data_path(&self, path: &Path) -> PathBuf {
        resolve(&self.data_dir, path)
    }

    /// Path under `solutions_dir` (absolute paths are kept)
    pub fn solutions_path(&self, path: &Path) -> PathBuf {
        resolve(&self.solutions_dir, path)
    }

    pub fn refined_dir(&self) -> PathBuf {
        self.data_path(&self.refined_dir)
    }

    /// Output of step 1, input of step 2
    pub fn subset_output(&self) -> PathBuf {
        self.refined_dir()
            .join(format!("{}.geojson", self.subset.output_name))
    }

    /// Output of step 2, input of steps 3 and 4
    pub fn companies_output(&self) -> PathBuf {
        self.refined_dir()
            .join(format!("{}.geojson", self.companies.output_name))
    }
}

impl MapConfig {
    pub fn tile_layer(&self) -> Result<TileLayer> {
        tile_layer(&self.tiles)
    }
}

impl BestChoiceConfig {
    pub fn tile_layer(&self) -> Result<TileLayer> {
        tile_layer(&self.tiles)
    }
}

fn tile_layer(name: &str) -> Result<TileLayer> {
    TileLayer::from_name(name).with_context(|| format!("Unknown tiles '{}'", name))
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.subset_output(),
            PathBuf::from("./data/RefinedData/NSD_peeled.geojson")
        );
        assert_eq!(
            config.companies_output(),
            PathBuf::from("./data/RefinedData/NSD_joined.geojson")
        );
        assert_eq!(
            config.solutions_path(&config.best_choice.output_html),
            PathBuf::from("./solutions/4.map.folium.html")
        );
        assert_eq!(config.companies.fields.len(), 6);
        assert_eq!(config.best_choice.max_distance, Some(3000.0));
        assert_eq!(config.map.zoom_start, Some(9));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
data_dir: /srv/norwich
subset:
  min_hectares: 2.5
  ward_filter: null
best_choice:
  max_distance: 1500
  tiles: openstreetmap
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.subset.min_hectares, 2.5);
        assert_eq!(config.subset.ward_filter, None);
        assert_eq!(config.subset.ward_layer.as_deref(), Some(DEFAULT_WARD_LAYER));
        assert_eq!(config.best_choice.max_distance, Some(1500.0));
        assert_eq!(config.best_choice.tile_layer().unwrap(), TileLayer::openstreetmap());
        assert_eq!(
            config.data_path(&config.subset.wards),
            PathBuf::from("/srv/norwich/wards_cropped.geojson")
        );
        assert_eq!(
            config.data_path(Path::new("/tmp/wards.geojson")),
            PathBuf::from("/tmp/wards.geojson")
        );
    }

    #[test]
    fn test_empty_and_invalid_yaml() {
        assert_eq!(PipelineConfig::from_yaml_str("").unwrap(), PipelineConfig::default());
        assert!(PipelineConfig::from_yaml_str("subset: [1, 2]").is_err());
        let config = PipelineConfig {
            map: MapConfig {
                tiles: "stamen".to_string(),
                ..MapConfig::default()
            },
            ..PipelineConfig::default()
        };
        assert!(config.map.tile_layer().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcelsite.yaml");
        let mut config = PipelineConfig::default();
        config.best_choice.output_geojson = Some(PathBuf::from("best.geojson"));
        fs::write(&path, config.to_yaml_string().unwrap()).unwrap();
        assert_eq!(PipelineConfig::from_yaml_file(&path).unwrap(), config);
        assert!(PipelineConfig::from_yaml_file(dir.path().join("missing.yaml")).is_err());
    }
}
