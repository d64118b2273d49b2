use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::collect::global_variables::{
    DATETIME_FIELDS, EPSG_WGS84, PARCELS_LAYER, PROPRIETOR_FIELD_MARKER,
};
use crate::collect::layer::{FeatureLayer, LayerFeature};
use crate::commons::basic_functions::is_null;
use crate::geo_core::GeoCore;
use crate::geometric::headroom::{Headroom, DEFAULT_HEADROOM_FILTER, DEFAULT_HEADROOM_LAYER};
use crate::geometric::natural_beauty::NaturalBeauty;
use crate::geometric::parcel_map::{empty_map, layer_map, MapOptions};
use crate::geometric::spatial_join::{sjoin_nearest, subtract_mask, JoinHow, NearestJoinOptions};
use crate::visual::leaflet::{LeafletMap, TileLayer};

pub const BEST_MAP_TITLE: &str = "Best parcels to build a utility-scale solar park";
pub const BEST_PAGE_TITLE: &str = "Norwich Best Parcels";
pub const BEST_LAYER_NAME: &str = "best parcels";
pub const DEFAULT_BEST_MAP: &str = "./solutions/4.map.folium.html";
/// Parcels farther than this from positive headroom (metres) are discarded
pub const DEFAULT_MAX_DISTANCE: f64 = 3000.0;
pub const DEFAULT_TENURE_FILTER: &str = "dom_Tenure == 'Freehold' | for_Tenure == 'Freehold'";

/// Step 4: freehold parcels with a single company owner, near positive grid
/// headroom and outside the AONB
pub struct BestChoice {
    parcels_path: PathBuf,
    headroom_path: PathBuf,
    aonb_path: PathBuf,
    output_path: PathBuf,
    pub geo_core: GeoCore,
    parcels_layer: Option<String>,
    headroom_layer: Option<String>,
    headroom_filter: Option<String>,
    join_options: NearestJoinOptions,
    tenure_filter: String,
    page_title: String,
    options: MapOptions,
    layer: Option<FeatureLayer>,
    map: Option<LeafletMap>,
}

impl BestChoice {
    pub fn new(
        parcels_path: impl Into<PathBuf>,
        headroom_path: impl Into<PathBuf>,
        aonb_path: impl Into<PathBuf>,
        output_html: Option<String>,
    ) -> Result<Self> {
        let output_path = PathBuf::from(output_html.as_deref().unwrap_or(DEFAULT_BEST_MAP));
        let mut geo_core = GeoCore::new(EPSG_WGS84);
        geo_core.set_output_path(Some(output_path.to_string_lossy().to_string()));

        Ok(BestChoice {
            parcels_path: parcels_path.into(),
            headroom_path: headroom_path.into(),
            aonb_path: aonb_path.into(),
            output_path,
            geo_core,
            parcels_layer: Some(PARCELS_LAYER.to_string()),
            headroom_layer: Some(DEFAULT_HEADROOM_LAYER.to_string()),
            headroom_filter: Some(DEFAULT_HEADROOM_FILTER.to_string()),
            join_options: NearestJoinOptions {
                max_distance: Some(DEFAULT_MAX_DISTANCE),
                distance_col: Some("dist".to_string()),
                lsuffix: String::new(),
                rsuffix: "_".to_string(),
                how: JoinHow::Left,
            },
            tenure_filter: DEFAULT_TENURE_FILTER.to_string(),
            page_title: BEST_PAGE_TITLE.to_string(),
            options: MapOptions {
                title: BEST_MAP_TITLE.to_string(),
                layer_name: BEST_LAYER_NAME.to_string(),
                zoom_start: None,
                click_popup: false,
                tiles: TileLayer::default(),
            },
            layer: None,
            map: None,
        })
    }

    pub fn set_parcels_layer(&mut self, layer: Option<String>) {
        self.parcels_layer = layer;
    }

    pub fn set_headroom_layer(&mut self, layer: Option<String>, filter: Option<String>) {
        self.headroom_layer = layer;
        self.headroom_filter = filter;
    }

    pub fn set_max_distance(&mut self, max_distance: Option<f64>) {
        self.join_options.max_distance = max_distance;
    }

    pub fn set_tenure_filter(&mut self, filter: &str) {
        self.tenure_filter = filter.to_string();
    }

    pub fn set_titles(&mut self, title: &str, page_title: &str) {
        self.options.title = title.to_string();
        self.page_title = page_title.to_string();
    }

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

    /// Without all three inputs only the empty map is produced
    pub fn run_internal(&mut self) -> Result<()> {
        let missing: Vec<&PathBuf> = [&self.parcels_path, &self.headroom_path, &self.aonb_path]
            .into_iter()
            .filter(|p| !p.is_file())
            .collect();
        if !missing.is_empty() {
            for path in missing {
                warn!("Input {} not found", path.display());
            }
            self.map = Some(empty_map(&self.options));
            return Ok(());
        }

        let parcels = FeatureLayer::read(&self.parcels_path, self.parcels_layer.as_deref(), None, None)
            .context("Failed to read parcels")?;
        let epsg = parcels.epsg;

        let headroom = Headroom::read(
            &self.headroom_path,
            self.headroom_layer.as_deref(),
            self.headroom_filter.as_deref(),
        )?
        .prepare()?
        .to_crs(epsg)
        .context("Failed to reproject headroom to the parcels CRS")?;

        let aonb = NaturalBeauty::read(&self.aonb_path, Some(epsg))?;

        let best = select_best(parcels, &headroom, &aonb, &self.join_options, &self.tenure_filter)?;
        let best = best
            .to_crs(EPSG_WGS84)
            .context("Failed to reproject best parcels to EPSG:4326")?;
        self.geo_core.set_bbox(best.total_bounds());

        self.map = Some(layer_map(best.clone(), &self.options)?);
        self.layer = Some(best);
        Ok(())
    }

    pub fn get_layer(&self) -> Option<&FeatureLayer> {
        self.layer.as_ref()
    }

    pub fn get_map(&self) -> Option<&LeafletMap> {
        self.map.as_ref()
    }

    /// Export the selected parcels (EPSG:4326)
    pub fn to_geojson<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let layer = self
            .layer
            .as_ref()
            .context("No best parcels available. Call run() first.")?;
        layer.write(path, Some(BEST_LAYER_NAME))
    }

    /// HTML page of the selection
    pub fn render_map(&self) -> Result<String> {
        let map = self
            .map
            .as_ref()
            .context("No map available. Call run() first.")?;
        map.render(&self.page_title)
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

/// Selection on layers sharing one projected CRS; the result stays in that CRS
pub fn select_best(
    parcels: FeatureLayer,
    headroom: &FeatureLayer,
    aonb: &NaturalBeauty,
    join_options: &NearestJoinOptions,
    tenure_filter: &str,
) -> Result<FeatureLayer> {
    let total = parcels.len();

    let mut near = sjoin_nearest(&parcels, headroom, join_options)?;
    if let Some(col) = join_options.distance_col.as_deref() {
        near.retain(|f| !is_null(f.get(col)));
    }
    info!("{} of {} parcels near positive headroom", near.len(), total);

    near.stringify_columns(DATETIME_FIELDS);

    if aonb.epsg() != near.epsg {
        anyhow::bail!(
            "CRS mismatch in overlay: EPSG:{} vs EPSG:{}",
            near.epsg,
            aonb.epsg()
        );
    }
    let mut outside = subtract_mask(&near, aonb.union());
    info!("{} parcels left outside the AONB", outside.len());

    outside
        .filter_str(tenure_filter)
        .context("Invalid tenure filter")?;
    outside.retain(has_single_owner);

    info!(
        "{} freehold parcels with a single company owner",
        outside.len()
    );
    Ok(outside)
}

/// Exactly one proprietor name column is filled
fn has_single_owner(feature: &LayerFeature) -> bool {
    feature
        .properties
        .iter()
        .filter(|(k, v)| k.contains(PROPRIETOR_FIELD_MARKER) && !v.is_null())
        .count()
        == 1
}
