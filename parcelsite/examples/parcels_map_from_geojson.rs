// Example: Web map of parcels loaded from GeoJSON
// This example shows how to build and save a Leaflet page from inline parcels
use anyhow::Result;
use parcelsite::collect::layer::FeatureLayer;
use parcelsite::geometric::parcel_map::map_center;
use parcelsite::visual::leaflet::{GeoJsonLayer, LayerControl, LeafletMap};

fn main() -> Result<()> {
    println!("=== Example: Parcels map from GeoJSON ===\n");

    // Two parcels south of Norwich, in WGS84
    let geojson_data = r#"
    {
        "type": "FeatureCollection",
        "name": "parcels",
        "features": [
            {
                "type": "Feature",
                "properties": {
                    "TITLE_NO": "NK101",
                    "dom_Tenure": "Freehold",
                    "dom_Proprietor Name (1)": "SUNNY FIELDS LIMITED",
                    "INSERT": "2012/08/03 00:00:00"
                },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [1.280, 52.590],
                        [1.290, 52.590],
                        [1.290, 52.596],
                        [1.280, 52.596],
                        [1.280, 52.590]
                    ]]
                }
            },
            {
                "type": "Feature",
                "properties": {
                    "TITLE_NO": "NK102",
                    "for_Tenure": "Freehold",
                    "for_Proprietor Name (1)": "OFFSHORE HOLDINGS S.A.",
                    "INSERT": "2015/01/20 00:00:00"
                },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [1.300, 52.600],
                        [1.304, 52.600],
                        [1.304, 52.603],
                        [1.300, 52.603],
                        [1.300, 52.600]
                    ]]
                }
            }
        ]
    }
    "#;

    let mut parcels = FeatureLayer::from_geojson_str(geojson_data, Some("parcels"), None)?;
    parcels.align_columns();
    parcels.stringify_columns(&["INSERT", "UPDATE"]);
    println!("Parcels loaded: {} (EPSG:{})", parcels.len(), parcels.epsg);

    // Area-weighted centre, computed on the National Grid
    if let Some(center) = map_center(&parcels)? {
        println!("Map centre: ({:.6}, {:.6})", center.x(), center.y());
    }

    let mut map = LeafletMap::new()
        .zoom_start(13)
        .title("Parcels owned by foreign and domestic companies");
    // Tooltip on the title and owners only, full attributes on click
    let overlay = GeoJsonLayer::from_layer(&parcels, "parcels")?
        .with_tooltip_fields(vec![
            "TITLE_NO".to_string(),
            "dom_Proprietor Name (1)".to_string(),
            "for_Proprietor Name (1)".to_string(),
        ])
        .with_click_popup(true);
    map.add_geojson_layer(overlay);
    map.add_fullscreen();
    map.add_layer_control(LayerControl::default());
    if let Some(bounds) = parcels.total_bounds() {
        map.fit_bounds(bounds.to_leaflet_bounds());
    }

    map.save("./output/parcels_map.html", "Norwich Parcels")?;
    println!("\nMap saved to ./output/parcels_map.html");

    Ok(())
}
