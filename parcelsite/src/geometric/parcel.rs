use anyhow::{Context, Result};
use geo::{Contains, MultiPolygon};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::collect::global_variables::{
    EPSG_WGS84, OUTPUT_PATH, PARCELS_LAYER, SQUARE_METRES_PER_HECTARE,
};
use crate::collect::layer::{FeatureLayer, LayerFeature};
use crate::commons::geometry::{area, representative_point, to_multi_polygon};
use crate::geo_core::GeoCore;
use crate::geometric::ward::{Wards, DEFAULT_WARD_FILTER, DEFAULT_WARD_LAYER};

/// Layer of the merged cadastral parcels extract
pub const DEFAULT_PARCELS_LAYER: &str = "merged";
pub const DEFAULT_MIN_HECTARES: f64 = 1.0;

/// Step 1: parcels of at least `min_hectares` whose representative point lies
/// within the target wards
pub struct ParcelSubset {
    parcels_path: PathBuf,
    wards_path: PathBuf,
    /// Output directory for processed data
    output_path: PathBuf,
    /// GeoCore for CRS handling
    pub geo_core: GeoCore,
    min_hectares: f64,
    parcels_layer: Option<String>,
    ward_layer: Option<String>,
    ward_filter: Option<String>,
    set_crs: Option<i32>,
    layer: Option<FeatureLayer>,
}

impl ParcelSubset {
    pub fn new(
        parcels_path: impl Into<PathBuf>,
        wards_path: impl Into<PathBuf>,
        output_path: Option<String>,
        set_crs: Option<i32>,
    ) -> Result<Self> {
        let output_path_buf = PathBuf::from(output_path.as_deref().unwrap_or(OUTPUT_PATH));

        let mut geo_core = match set_crs {
            Some(epsg) => GeoCore::new(epsg),
            None => GeoCore::default(),
        };
        geo_core.set_output_path(Some(output_path_buf.to_string_lossy().to_string()));

        Ok(ParcelSubset {
            parcels_path: parcels_path.into(),
            wards_path: wards_path.into(),
            output_path: output_path_buf,
            geo_core,
            min_hectares: DEFAULT_MIN_HECTARES,
            parcels_layer: Some(DEFAULT_PARCELS_LAYER.to_string()),
            ward_layer: Some(DEFAULT_WARD_LAYER.to_string()),
            ward_filter: Some(DEFAULT_WARD_FILTER.to_string()),
            set_crs,
            layer: None,
        })
    }

    pub fn set_min_hectares(&mut self, min_hectares: f64) {
        self.min_hectares = min_hectares;
    }

    pub fn set_parcels_layer(&mut self, layer: Option<String>) {
        self.parcels_layer = layer;
    }

    pub fn set_ward_layer(&mut self, layer: Option<String>) {
        self.ward_layer = layer;
    }

    /// Attribute filter on the wards, None keeps every ward
    pub fn set_ward_filter(&mut self, filter: Option<String>) {
        self.ward_filter = filter;
    }

    pub fn run(mut self) -> Result<Self> {
        self.run_internal()?;
        Ok(self)
    }

    pub fn run_internal(&mut self) -> Result<()> {
        let parcels = FeatureLayer::read(
            &self.parcels_path,
            self.parcels_layer.as_deref(),
            None,
            self.set_crs,
        )
        .context("Failed to read parcels")?;
        self.geo_core.set_epsg(parcels.epsg);

        let wards = Wards::read(
            &self.wards_path,
            self.ward_layer.as_deref(),
            self.ward_filter.as_deref(),
        )?
        .to_crs(parcels.epsg)
        .context("Failed to reproject wards to the parcels CRS")?;

        let wards_union = wards.union_all();
        let subset = subset_parcels(parcels, &wards_union, self.min_hectares);
        self.geo_core.set_bbox(subset.total_bounds());
        self.layer = Some(subset);
        Ok(())
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
            .join(format!("{}.geojson", name.unwrap_or("NSD_peeled")));
        layer.write(&output_file, Some(PARCELS_LAYER))?;
        Ok(output_file)
    }

    pub fn get_output_path(&self) -> &Path {
        &self.output_path
    }
}

/// Keep large parcels whose representative point is inside the ward union.
/// Geometries and columns of the kept parcels are untouched, in input order.
pub fn subset_parcels(
    parcels: FeatureLayer,
    wards_union: &MultiPolygon<f64>,
    min_hectares: f64,
) -> FeatureLayer {
    if parcels.epsg == EPSG_WGS84 {
        warn!("Parcels are in geographic coordinates, areas are in square degrees");
    }

    let total = parcels.len();
    let keep = |feature: &LayerFeature| -> bool {
        let geometry = match feature.geometry.as_ref() {
            Some(g) if to_multi_polygon(g).is_some() => g,
            _ => {
                debug!("Skipping parcel without polygonal geometry");
                return false;
            }
        };
        if area(geometry) / SQUARE_METRES_PER_HECTARE < min_hectares {
            return false;
        }
        representative_point(geometry)
            .map(|point| wards_union.contains(&point))
            .unwrap_or(false)
    };

    #[cfg(feature = "rayon")]
    let flags: Vec<bool> = parcels.features.par_iter().map(keep).collect();
    #[cfg(not(feature = "rayon"))]
    let flags: Vec<bool> = parcels.features.iter().map(keep).collect();

    let FeatureLayer {
        name,
        epsg,
        features,
    } = parcels;
    let features: Vec<LayerFeature> = features
        .into_iter()
        .zip(flags)
        .filter_map(|(f, k)| k.then_some(f))
        .collect();

    info!(
        "{} of {} parcels are at least {} ha and within the wards",
        features.len(),
        total,
        min_hectares
    );
    FeatureLayer::with_features(name, epsg, features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Geometry};
    use serde_json::{json, Map};

    fn parcel(id: i64, polygon: geo::Polygon<f64>) -> LayerFeature {
        let mut props = Map::new();
        props.insert("POLY_ID".into(), json!(id));
        props.insert("TITLE_NO".into(), json!(format!("NK{}", id)));
        LayerFeature::new(Some(Geometry::Polygon(polygon)), props)
    }

    fn square(x: f64, y: f64, side: f64) -> geo::Polygon<f64> {
        polygon![
            (x: x, y: y),
            (x: x + side, y: y),
            (x: x + side, y: y + side),
            (x: x, y: y + side),
            (x: x, y: y),
        ]
    }

    fn wards_union() -> MultiPolygon<f64> {
        MultiPolygon::new(vec![square(0.0, 0.0, 1000.0)])
    }

    #[test]
    fn test_subset_by_area_and_ward() {
        let parcels = FeatureLayer::with_features(
            Some("merged".into()),
            27700,
            vec![
                // 1.21 ha inside
                parcel(1, square(100.0, 100.0, 110.0)),
                // 0.64 ha inside, too small
                parcel(2, square(300.0, 300.0, 80.0)),
                // 4 ha, representative point outside the wards
                parcel(3, square(2000.0, 2000.0, 200.0)),
                // exactly 1 ha inside
                parcel(4, square(500.0, 500.0, 100.0)),
            ],
        );

        let subset = subset_parcels(parcels, &wards_union(), 1.0);
        let ids: Vec<i64> = subset
            .features
            .iter()
            .filter_map(|f| f.get("POLY_ID").and_then(|v| v.as_i64()))
            .collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(subset.epsg, 27700);
    }

    #[test]
    fn test_parcel_straddling_ward_boundary() {
        // Mostly outside: the representative point lands outside the ward
        let straddling = polygon![
            (x: 950.0, y: 0.0), (x: 1300.0, y: 0.0), (x: 1300.0, y: 100.0), (x: 950.0, y: 100.0), (x: 950.0, y: 0.0),
        ];
        let parcels = FeatureLayer::with_features(None, 27700, vec![parcel(5, straddling)]);
        let subset = subset_parcels(parcels, &wards_union(), 1.0);
        assert!(subset.is_empty());
    }

    #[test]
    fn test_parcels_without_polygon_are_dropped() {
        let mut props = Map::new();
        props.insert("POLY_ID".into(), json!(9));
        let parcels = FeatureLayer::with_features(
            None,
            27700,
            vec![
                LayerFeature::new(None, props.clone()),
                LayerFeature::new(Some(Geometry::Point(geo::Point::new(10.0, 10.0))), props),
            ],
        );
        assert!(subset_parcels(parcels, &wards_union(), 0.0).is_empty());
    }

    #[test]
    fn test_run_writes_parcels_layer() {
        let dir = tempfile::tempdir().unwrap();
        let parcels_path = dir.path().join("NSD_merged.geojson");
        let wards_path = dir.path().join("wards.geojson");

        let parcels = FeatureLayer::with_features(
            Some("merged".into()),
            27700,
            vec![parcel(1, square(100.0, 100.0, 110.0)), parcel(2, square(300.0, 300.0, 80.0))],
        );
        parcels.write(&parcels_path, None).unwrap();

        let mut ward_props = Map::new();
        ward_props.insert("WD24NM".into(), json!("Thurton"));
        let wards = FeatureLayer::with_features(
            Some(DEFAULT_WARD_LAYER.into()),
            27700,
            vec![LayerFeature::new(
                Some(Geometry::Polygon(square(0.0, 0.0, 1000.0))),
                ward_props,
            )],
        );
        wards.write(&wards_path, None).unwrap();

        let step = ParcelSubset::new(
            &parcels_path,
            &wards_path,
            Some(dir.path().join("out").to_string_lossy().to_string()),
            None,
        )
        .unwrap()
        .run()
        .unwrap();
        assert_eq!(step.get_layer().map(|l| l.len()), Some(1));

        let written = step.to_geojson(None).unwrap();
        let back = FeatureLayer::read(&written, Some(PARCELS_LAYER), None, None).unwrap();
        assert_eq!(back.name.as_deref(), Some(PARCELS_LAYER));
        assert_eq!(back.features[0].get("TITLE_NO"), Some(&json!("NK1")));
        assert_eq!(step.geo_core.get_epsg(), 27700);
    }
}
