#![cfg(feature = "reqwest")]

use parcelsite::collect::os_places::OsPlacesGeocoder;
use reqwest::blocking::Client;
use serde_json::json;
use tokio::runtime::Runtime;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Mock server on its own runtime; the blocking client must run outside it
fn start_server(runtime: &Runtime, status: u16, body: serde_json::Value) -> MockServer {
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/places/v1/find"))
            .and(query_param("key", "test-key"))
            .and(query_param("maxresults", "1"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        server
    })
}

fn geocoder(server: &MockServer) -> OsPlacesGeocoder {
    OsPlacesGeocoder::new("test-key").with_base_url(format!("{}/search/places/v1/find", server.uri()))
}

#[test]
fn test_geocode_parses_first_match() {
    let runtime = Runtime::new().unwrap();
    let body = json!({
        "header": { "totalresults": 1 },
        "results": [ { "DPA": { "ADDRESS": "CITY HALL, ST. PETERS STREET, NORWICH, NR2 1NH",
                                "X_COORDINATE": 622840.0, "Y_COORDINATE": 308520.0 } } ]
    });
    let server = start_server(&runtime, 200, body);

    let client = Client::new();
    let found = geocoder(&server)
        .geocode_with(&client, "City Hall, St Peters Street, Norwich")
        .unwrap();
    assert_eq!(found, Some((622840.0, 308520.0)));
}

#[test]
fn test_geocode_without_results() {
    let runtime = Runtime::new().unwrap();
    let server = start_server(&runtime, 200, json!({ "header": { "totalresults": 0 } }));

    let found = geocoder(&server).geocode("Nowhere Lane").unwrap();
    assert_eq!(found, None);
}

#[test]
fn test_geocode_error_status_is_no_match() {
    let runtime = Runtime::new().unwrap();
    let server = start_server(&runtime, 401, json!({ "fault": { "faultstring": "Invalid ApiKey" } }));

    let found = geocoder(&server).geocode("NR1 3JQ").unwrap();
    assert_eq!(found, None);

    // Wrong key: nothing mounted matches, the mock answers 404
    let other = OsPlacesGeocoder::new("other-key")
        .with_base_url(format!("{}/search/places/v1/find", server.uri()));
    assert_eq!(other.geocode("NR1 3JQ").unwrap(), None);
}
