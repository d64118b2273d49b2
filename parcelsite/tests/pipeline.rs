use serde_json::{json, Value};
use std::fs;
use std::path::Path;

use parcelsite::collect::layer::FeatureLayer;
use parcelsite::geometric::best_choice::BestChoice;
use parcelsite::geometric::ownership::OwnershipJoin;
use parcelsite::geometric::parcel::ParcelSubset;

const CRS_27700: &str = "urn:ogc:def:crs:EPSG::27700";

fn square(x: f64, y: f64, side: f64) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[[x, y], [x + side, y], [x + side, y + side], [x, y + side], [x, y]]]
    })
}

fn feature(geometry: Value, properties: Value) -> Value {
    json!({"type": "Feature", "properties": properties, "geometry": geometry})
}

fn write_collection(path: &Path, name: &str, features: Vec<Value>) {
    let collection = json!({
        "type": "FeatureCollection",
        "name": name,
        "crs": {"type": "name", "properties": {"name": CRS_27700}},
        "features": features,
    });
    fs::write(path, collection.to_string()).unwrap();
}

fn write_inputs(data: &Path) {
    write_collection(
        &data.join("wards_cropped.geojson"),
        "WD_MAY_2024_UK_BFC",
        vec![
            feature(
                square(620_000.0, 300_000.0, 10_000.0),
                json!({"WD24CD": "E05005791", "WD24NM": "Mancroft"}),
            ),
            feature(
                square(630_000.0, 300_000.0, 10_000.0),
                json!({"WD24CD": "E05005774", "WD24NM": "Loddon & Chedgrave"}),
            ),
        ],
    );

    let parcel = |x: f64, y: f64, side: f64, title: &str| {
        feature(
            square(x, y, side),
            json!({"INSPIREID": 1, "TITLE_NO": title, "INSERT": "2012/08/03 00:00:00", "UPDATE": null}),
        )
    };
    write_collection(
        &data.join("NSD_merged.geojson"),
        "merged",
        vec![
            // 4 ha, single domestic freehold owner, near headroom
            parcel(621_000.0, 301_000.0, 200.0, "NK1"),
            // 0.25 ha
            parcel(621_500.0, 301_500.0, 50.0, "NK2"),
            // Excluded ward
            parcel(635_000.0, 305_000.0, 200.0, "NK3"),
            // Overseas freehold, inside the AONB
            parcel(625_000.0, 305_000.0, 200.0, "NK4"),
            // Leasehold, far from headroom
            parcel(628_000.0, 308_000.0, 200.0, "NK5"),
            // No company owner
            parcel(622_500.0, 301_000.0, 200.0, "NK6"),
        ],
    );

    let header = "Title Number,Tenure,Property Address,District,County,Proprietor Name (1),Proprietor Name (2),Proprietor Name (3),Proprietor Name (4)";
    fs::write(
        data.join("CCOD.csv"),
        format!(
            "{}\nNK1,Freehold,\"Land at Keswick, Norwich\",SOUTH NORFOLK,NORFOLK,SUNNY FIELDS LIMITED,,,\n\
             NK5,Leasehold,Land at Hethel,SOUTH NORFOLK,NORFOLK,WIDGETS PLC,,,\n\
             NK9,Freehold,Land in Guildford,GUILDFORD,SURREY,ELSEWHERE LTD,,,\n",
            header
        ),
    )
    .unwrap();
    fs::write(
        data.join("OCOD.csv"),
        format!(
            "{}\nNK4,Freehold,Land at Beccles,EAST SUFFOLK,SUFFOLK,OFFSHORE HOLDINGS S.A.,,,\n",
            header
        ),
    )
    .unwrap();

    let headroom = |supply: &str, headroom: f64| {
        feature(
            square(622_000.0, 302_000.0, 1_000.0),
            json!({"category": "Demand Headroom", "gridsupplypoint": supply, "headroom": headroom}),
        )
    };
    write_collection(
        &data.join("generation_headroom_.geojson"),
        "dfes-network-headroom-report",
        vec![
            headroom("Norwich Main", 15.0),
            headroom("Norwich Main", -5.0),
            feature(
                square(628_000.0, 309_000.0, 500.0),
                json!({"category": "Demand Headroom", "gridsupplypoint": "Walpole", "headroom": -20.0}),
            ),
            feature(
                square(628_000.0, 309_000.0, 500.0),
                json!({"category": "Generation Headroom", "gridsupplypoint": "Walpole", "headroom": 40.0}),
            ),
        ],
    );

    write_collection(
        &data.join("aonb.json"),
        "Areas_of_Outstanding_Natural_Beauty_England",
        vec![feature(
            square(624_900.0, 304_900.0, 600.0),
            json!({"name": "Norfolk Coast"}),
        )],
    );
}

fn titles(layer: &FeatureLayer) -> Vec<String> {
    layer
        .features
        .iter()
        .filter_map(|f| f.get("TITLE_NO"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

#[test]
fn test_steps_one_two_four() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path();
    write_inputs(data);
    let refined = data.join("RefinedData");
    let refined_str = refined.to_string_lossy().to_string();

    // Step 1
    let peeled = ParcelSubset::new(
        data.join("NSD_merged.geojson"),
        data.join("wards_cropped.geojson"),
        Some(refined_str.clone()),
        None,
    )
    .unwrap()
    .run()
    .unwrap()
    .to_geojson(None)
    .unwrap();
    assert_eq!(peeled, refined.join("NSD_peeled.geojson"));
    let subset = FeatureLayer::read(&peeled, None, None, None).unwrap();
    assert_eq!(subset.epsg, 27700);
    assert_eq!(titles(&subset), vec!["NK1", "NK4", "NK5", "NK6"]);

    // Step 2
    let step = OwnershipJoin::new(
        &peeled,
        data.join("CCOD.csv"),
        data.join("OCOD.csv"),
        Some(refined_str),
    )
    .unwrap()
    .run()
    .unwrap();
    let joined_path = step.to_geojson(None).unwrap();
    let joined = step.get_layer().unwrap();
    assert_eq!(joined.len(), 4);
    let nk1 = &joined.features[0];
    assert_eq!(nk1.get("dom_Tenure"), Some(&json!("Freehold")));
    assert_eq!(nk1.get("dom_Proprietor Name (1)"), Some(&json!("SUNNY FIELDS LIMITED")));
    assert_eq!(nk1.get("for_Tenure"), Some(&Value::Null));
    let nk4 = &joined.features[1];
    assert_eq!(nk4.get("for_Proprietor Name (1)"), Some(&json!("OFFSHORE HOLDINGS S.A.")));
    assert_eq!(nk4.get("dom_Title Number"), Some(&Value::Null));
    // Unmatched parcels share the same columns
    let columns = joined.features[0].properties.len();
    assert!(joined.features.iter().all(|f| f.properties.len() == columns));

    // Step 4
    let html = dir.path().join("solutions/4.map.folium.html");
    let best = BestChoice::new(
        &joined_path,
        data.join("generation_headroom_.geojson"),
        data.join("aonb.json"),
        Some(html.to_string_lossy().to_string()),
    )
    .unwrap()
    .run()
    .unwrap();

    let layer = best.get_layer().unwrap();
    assert_eq!(layer.epsg, 4326);
    assert_eq!(titles(layer), vec!["NK1"]);
    let row = &layer.features[0];
    assert_eq!(row.get("gridsupplypoint"), Some(&json!("Norwich Main")));
    assert_eq!(row.get("INSERT"), Some(&json!("2012-08-03T00:00:00")));
    let dist = row.get("dist").and_then(Value::as_f64).unwrap();
    assert!((dist - 800.0 * 2f64.sqrt()).abs() < 1e-6);

    best.save().unwrap();
    let page = fs::read_to_string(&html).unwrap();
    assert!(page.contains("<title>Norwich Best Parcels</title>"));
    assert!(page.contains("SUNNY FIELDS LIMITED"));
    assert!(!page.contains("OFFSHORE HOLDINGS"));
}
