use std::path::PathBuf;

/// Default data directory, relative paths in the configuration resolve against it
pub const DATA_PATH: &str = "./data";
/// Default directory of the intermediate parcel layers
pub const OUTPUT_PATH: &str = "./data/RefinedData";
/// Default directory of the rendered maps and the geocoder key file
pub const SOLUTIONS_PATH: &str = "./solutions";

pub const EPSG_BRITISH_NATIONAL_GRID: i32 = 27700;
pub const EPSG_WGS84: i32 = 4326;

pub const SQUARE_METRES_PER_HECTARE: f64 = 10_000.0;

/// Layer name written into every parcel GeoJSON output
pub const PARCELS_LAYER: &str = "parcels";

pub const TITLE_NUMBER_FIELD: &str = "Title Number";
pub const PARCEL_TITLE_FIELD: &str = "TITLE_NO";
pub const PROPRIETOR_FIELD_MARKER: &str = "Proprietor Name";

/// Timestamp columns of the cadastral parcels that are rendered as text on maps
pub const DATETIME_FIELDS: &[&str] = &["INSERT", "UPDATE"];

pub fn get_data_path() -> PathBuf {
    PathBuf::from(DATA_PATH)
}
