#[cfg(feature = "proj")]
use anyhow::Context;
use anyhow::Result;
use geo::{Coord, Geometry, MapCoords, Point, Rect};
#[cfg(feature = "proj")]
use proj::Proj;

use crate::collect::global_variables::{EPSG_BRITISH_NATIONAL_GRID, EPSG_WGS84};
#[cfg(not(feature = "proj"))]
use crate::commons::national_grid;
#[cfg(not(feature = "proj"))]
use crate::error::Error;

/// Base struct for geospatial operations
/// Handles CRS (Coordinate Reference System), bounding box and output paths
#[derive(Debug, Clone)]
pub struct GeoCore {
    /// EPSG code of the working CRS
    pub epsg: i32,
    /// Bounding box of the data in the working CRS
    pub bbox: Option<BoundingBox>,
    /// Output path for processed data
    pub output_path: Option<String>,
}

impl Default for GeoCore {
    /// Parcels, wards and registry extracts are all published on the British National Grid
    fn default() -> Self {
        GeoCore::new(EPSG_BRITISH_NATIONAL_GRID)
    }
}

impl GeoCore {
    /// Create a new GeoCore with EPSG
    pub fn new(epsg: i32) -> Self {
        GeoCore {
            epsg,
            bbox: None,
            output_path: None,
        }
    }

    /// Get EPSG code
    pub fn get_epsg(&self) -> i32 {
        self.epsg
    }

    /// Set EPSG code
    pub fn set_epsg(&mut self, epsg: i32) {
        self.epsg = epsg;
    }

    /// Get bounding box
    pub fn get_bbox(&self) -> Option<BoundingBox> {
        self.bbox
    }

    /// Set bounding box
    pub fn set_bbox(&mut self, bbox: Option<BoundingBox>) {
        self.bbox = bbox;
    }

    /// Get output path
    pub fn get_output_path(&self) -> Option<&String> {
        self.output_path.as_ref()
    }

    /// Set output path
    pub fn set_output_path(&mut self, output_path: Option<String>) {
        self.output_path = output_path;
    }

    /// Whether the working CRS is geographic (degrees), where planar areas are meaningless
    pub fn is_geographic(&self) -> bool {
        self.epsg == EPSG_WGS84
    }

    /// Transform coordinates from one CRS to another
    pub fn transform_coords(from_epsg: i32, to_epsg: i32, x: f64, y: f64) -> Result<(f64, f64)> {
        Reprojector::new(from_epsg, to_epsg)?.transform_coords(x, y)
    }

    /// Transform a Point from one CRS to another
    pub fn transform_point(from_epsg: i32, to_epsg: i32, point: Point<f64>) -> Result<Point<f64>> {
        let (x, y) = Self::transform_coords(from_epsg, to_epsg, point.x(), point.y())?;
        Ok(Point::new(x, y))
    }

    /// Reprojector from this CRS to another one
    pub fn reprojector_to(&self, to_epsg: i32) -> Result<Reprojector> {
        Reprojector::new(self.epsg, to_epsg)
    }
}

/// Coordinate transformation between two EPSG codes.
///
/// Built once and reused for every coordinate of a layer.
pub enum Reprojector {
    Identity,
    #[cfg(feature = "proj")]
    Proj(Proj),
    #[cfg(not(feature = "proj"))]
    NationalGridToWgs84,
    #[cfg(not(feature = "proj"))]
    Wgs84ToNationalGrid,
}

impl Reprojector {
    pub fn new(from_epsg: i32, to_epsg: i32) -> Result<Self> {
        if from_epsg == to_epsg {
            return Ok(Reprojector::Identity);
        }
        Self::between(from_epsg, to_epsg)
    }

    #[cfg(feature = "proj")]
    fn between(from_epsg: i32, to_epsg: i32) -> Result<Self> {
        let from_crs = format!("EPSG:{}", from_epsg);
        let to_crs = format!("EPSG:{}", to_epsg);

        let proj = Proj::new_known_crs(&from_crs, &to_crs, None)
            .context("Failed to create Proj transformation")?;
        Ok(Reprojector::Proj(proj))
    }

    #[cfg(not(feature = "proj"))]
    fn between(from_epsg: i32, to_epsg: i32) -> Result<Self> {
        match (from_epsg, to_epsg) {
            (EPSG_BRITISH_NATIONAL_GRID, EPSG_WGS84) => Ok(Reprojector::NationalGridToWgs84),
            (EPSG_WGS84, EPSG_BRITISH_NATIONAL_GRID) => Ok(Reprojector::Wgs84ToNationalGrid),
            (from, to) => Err(Error::UnsupportedCrs { from, to }.into()),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Reprojector::Identity)
    }

    pub fn transform_coords(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        match self {
            Reprojector::Identity => Ok((x, y)),
            #[cfg(feature = "proj")]
            Reprojector::Proj(proj) => proj
                .convert((x, y))
                .context("Failed to transform coordinates"),
            #[cfg(not(feature = "proj"))]
            Reprojector::NationalGridToWgs84 => Ok(national_grid::to_wgs84(x, y)),
            #[cfg(not(feature = "proj"))]
            Reprojector::Wgs84ToNationalGrid => Ok(national_grid::from_wgs84(x, y)),
        }
    }

    pub fn transform_geometry(&self, geometry: &Geometry<f64>) -> Result<Geometry<f64>> {
        if self.is_identity() {
            return Ok(geometry.clone());
        }
        geometry.try_map_coords(|c: Coord<f64>| {
            let (x, y) = self.transform_coords(c.x, c.y)?;
            Ok::<_, anyhow::Error>(Coord { x, y })
        })
    }
}

/// Bounding box structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64, // min longitude / easting
    pub min_y: f64, // min latitude / northing
    pub max_x: f64, // max longitude / easting
    pub max_y: f64, // max latitude / northing
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn from_rect(rect: Rect<f64>) -> Self {
        BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }

    /// Smallest box covering both
    pub fn union(&self, other: &BoundingBox) -> Self {
        BoundingBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Leaflet `fitBounds` form: `[[south, west], [north, east]]`
    pub fn to_leaflet_bounds(&self) -> [[f64; 2]; 2] {
        [[self.min_y, self.min_x], [self.max_y, self.max_x]]
    }

    /// Transform bounding box to another CRS
    pub fn transform(&self, from_epsg: i32, to_epsg: i32) -> Result<Self> {
        let (min_x, min_y) = GeoCore::transform_coords(from_epsg, to_epsg, self.min_x, self.min_y)?;
        let (max_x, max_y) = GeoCore::transform_coords(from_epsg, to_epsg, self.max_x, self.max_y)?;

        Ok(BoundingBox::new(min_x, min_y, max_x, max_y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn test_geo_core_default() {
        let mut gc = GeoCore::default();
        assert_eq!(gc.get_epsg(), 27700);
        assert!(!gc.is_geographic());
        assert!(gc.get_bbox().is_none());
        assert!(gc.reprojector_to(27700).unwrap().is_identity());

        gc.set_bbox(Some(BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
        assert_eq!(gc.get_bbox(), Some(BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn test_bounding_box() {
        let bbox: BoundingBox = BoundingBox::new(0.0, 0.0, 1.0, 2.0);
        assert_eq!(bbox.min_x, 0.0);
        assert_eq!(bbox.max_x, 1.0);
        assert_eq!(bbox.center(), (0.5, 1.0));
        assert_eq!(bbox.to_leaflet_bounds(), [[0.0, 0.0], [2.0, 1.0]]);

        let other = BoundingBox::new(-1.0, 1.0, 0.5, 3.0);
        assert_eq!(bbox.union(&other), BoundingBox::new(-1.0, 0.0, 1.0, 3.0));
    }

    #[test]
    fn test_identity_reprojection() {
        let r = Reprojector::new(27700, 27700).unwrap();
        assert!(r.is_identity());
        assert_eq!(r.transform_coords(1.0, 2.0).unwrap(), (1.0, 2.0));
    }

    #[test]
    fn test_transform_coords() {
        // Norwich, British National Grid -> WGS84
        let (lon, lat) = GeoCore::transform_coords(27700, 4326, 623_000.0, 308_500.0).unwrap();
        assert!((lat - 52.63).abs() < 0.02);
        assert!((lon - 1.29).abs() < 0.02);
    }

    #[test]
    fn test_transform_geometry() {
        let square: geo::Polygon<f64> = polygon![
            (x: 623_000.0, y: 308_500.0),
            (x: 623_100.0, y: 308_500.0),
            (x: 623_100.0, y: 308_600.0),
            (x: 623_000.0, y: 308_600.0),
            (x: 623_000.0, y: 308_500.0),
        ];
        let r = Reprojector::new(27700, 4326).unwrap();
        let out = r.transform_geometry(&Geometry::Polygon(square)).unwrap();
        match out {
            Geometry::Polygon(p) => {
                assert_eq!(p.exterior().0.len(), 5);
                assert!(p.exterior().0.iter().all(|c| c.x > 1.0 && c.x < 2.0));
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn test_bounding_box_transform() {
        // Norwich study area on the National Grid
        let bbox = BoundingBox::new(620_000.0, 300_000.0, 640_000.0, 315_000.0);
        let wgs84 = bbox.transform(27700, 4326).unwrap();
        assert!(wgs84.min_x < wgs84.max_x && wgs84.min_y < wgs84.max_y);
        assert!(wgs84.min_x > 1.0 && wgs84.max_x < 2.0);
        assert!(wgs84.min_y > 52.0 && wgs84.max_y < 53.0);

        let back = wgs84.transform(4326, 27700).unwrap();
        assert!((back.min_x - bbox.min_x).abs() < 0.01);
        assert!((back.max_y - bbox.max_y).abs() < 0.01);

        assert_eq!(bbox.transform(27700, 27700).unwrap(), bbox);
    }

    #[cfg(not(feature = "proj"))]
    #[test]
    fn test_unsupported_pair() {
        assert!(Reprojector::new(2154, 4326).is_err());
    }
}
