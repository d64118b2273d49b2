// Example: Geocoding an address with the OS Places API
// Needs OS_DATA_HUB_API_KEY in the environment
use anyhow::Result;
use parcelsite::collect::global_variables::{EPSG_BRITISH_NATIONAL_GRID, EPSG_WGS84};
use parcelsite::collect::os_places::OsPlacesGeocoder;
use parcelsite::geo_core::GeoCore;

fn main() -> Result<()> {
    println!("=== Example: OS Places geocoding ===\n");

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "City Hall, St Peters Street, Norwich".to_string());

    let geocoder = OsPlacesGeocoder::from_env()?;
    println!("Request: {}", geocoder.find_url(&address)?.as_str().split("&key=").next().unwrap_or(""));

    match geocoder.geocode(&address)? {
        Some((easting, northing)) => {
            let (lon, lat) =
                GeoCore::transform_coords(EPSG_BRITISH_NATIONAL_GRID, EPSG_WGS84, easting, northing)?;
            println!("British National Grid: ({:.1}, {:.1})", easting, northing);
            println!("WGS84: ({:.6}, {:.6})", lon, lat);
        }
        None => println!("No match for '{}'", address),
    }

    Ok(())
}
