use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use url::Url;

#[cfg(feature = "reqwest")]
use reqwest::blocking::Client;

/// OS Places API `find` endpoint
pub const OS_PLACES_FIND_URL: &str = "https://api.os.uk/search/places/v1/find";
/// Environment variable holding the OS Data Hub key
pub const API_KEY_ENV: &str = "OS_DATA_HUB_API_KEY";

/// Free-text address lookup against the Ordnance Survey Places API.
/// Coordinates come back on the British National Grid (EPSG:27700).
#[derive(Debug, Clone)]
pub struct OsPlacesGeocoder {
    api_key: String,
    base_url: String,
}

impl OsPlacesGeocoder {
    pub fn new(api_key: impl Into<String>) -> Self {
        OsPlacesGeocoder {
            api_key: api_key.into(),
            base_url: OS_PLACES_FIND_URL.to_string(),
        }
    }

    /// Read the key from a text file (surrounding whitespace ignored)
    pub fn from_key_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let key = fs::read_to_string(path)
            .with_context(|| format!("Failed to read API key file: {}", path.display()))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("API key file is empty: {}", path.display());
        }
        Ok(Self::new(key))
    }

    pub fn from_env() -> Result<Self> {
        let key = std::env::var(API_KEY_ENV)
            .with_context(|| format!("Environment variable {} is not set", API_KEY_ENV))?;
        Ok(Self::new(key.trim()))
    }

    /// Point the geocoder at another endpoint (proxy or mock server)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Request URL for one address: first English-language result in England only
    pub fn find_url(&self, address: &str) -> Result<Url> {
        let url = format!(
            "{}?query={}&maxresults=1&lr=EN&fq=COUNTRY_CODE:E&key={}",
            self.base_url,
            urlencoding::encode(address),
            urlencoding::encode(&self.api_key)
        );
        Url::parse(&url).with_context(|| format!("Invalid OS Places URL: {}", self.base_url))
    }

    /// Easting/northing of the best match, None when nothing matched or the
    /// service answered with a non-success status
    #[cfg(feature = "reqwest")]
    pub fn geocode(&self, address: &str) -> Result<Option<(f64, f64)>> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        self.geocode_with(&client, address)
    }

    #[cfg(feature = "reqwest")]
    pub fn geocode_with(&self, client: &Client, address: &str) -> Result<Option<(f64, f64)>> {
        let url = self.find_url(address)?;
        debug!("OS Places request for '{}'", address);

        let response = client
            .get(url)
            .send()
            .context("Failed to send request to OS Places API")?;

        if !response.status().is_success() {
            warn!("OS Places API returned {} for '{}'", response.status(), address);
            return Ok(None);
        }

        let body: Value = response
            .json()
            .context("Failed to decode OS Places response")?;
        Ok(parse_find_response(&body))
    }
}

/// `X_COORDINATE`/`Y_COORDINATE` of the first DPA result
pub fn parse_find_response(body: &Value) -> Option<(f64, f64)> {
    let dpa = body.get("results")?.as_array()?.first()?.get("DPA")?;
    let x = coordinate(dpa.get("X_COORDINATE")?)?;
    let y = coordinate(dpa.get("Y_COORDINATE")?)?;
    Some((x, y))
}

fn coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
