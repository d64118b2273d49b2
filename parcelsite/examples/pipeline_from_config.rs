use anyhow::Result;
use parcelsite::geometric::best_choice::BestChoice;
use parcelsite::geometric::ownership::OwnershipJoin;
use parcelsite::geometric::parcel::ParcelSubset;
use parcelsite::PipelineConfig;

/// Example: Steps 1, 2 and 4 driven by a YAML configuration
/// Usage: cargo run --example pipeline_from_config -- parcelsite.yaml
fn main() -> Result<()> {
    println!("=== Example: Parcel pipeline from configuration ===\n");

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::default(),
    };
    println!("Data directory: {}", config.data_dir.display());
    println!("Minimum parcel size: {} ha\n", config.subset.min_hectares);

    let refined = config.refined_dir().to_string_lossy().to_string();

    // Step 1: parcels inside the target wards
    let mut subset = ParcelSubset::new(
        config.data_path(&config.subset.parcels),
        config.data_path(&config.subset.wards),
        Some(refined.clone()),
        None,
    )?;
    subset.set_min_hectares(config.subset.min_hectares);
    let subset = subset.run()?;
    let peeled = subset.to_geojson(Some(&config.subset.output_name))?;
    println!(
        "Step 1: {} parcels -> {}",
        subset.get_layer().map(|l| l.len()).unwrap_or(0),
        peeled.display()
    );

    // Step 2: company ownership
    let joined = OwnershipJoin::new(
        &peeled,
        config.data_path(&config.companies.ccod),
        config.data_path(&config.companies.ocod),
        Some(refined),
    )?
    .run()?;
    let joined_path = joined.to_geojson(Some(&config.companies.output_name))?;
    println!("Step 2: ownership joined -> {}", joined_path.display());

    // Step 4: best parcels
    let best = BestChoice::new(
        &joined_path,
        config.data_path(&config.best_choice.headroom),
        config.data_path(&config.best_choice.aonb),
        Some(
            config
                .solutions_path(&config.best_choice.output_html)
                .to_string_lossy()
                .to_string(),
        ),
    )?
    .run()?;
    best.save()?;

    match best.get_layer() {
        Some(layer) => {
            println!("Step 4: {} best parcels", layer.len());
            for feature in &layer.features {
                println!("  - {:?}", feature.get("TITLE_NO"));
            }
        }
        None => println!("Step 4: inputs missing, empty map saved"),
    }
    println!("Map: {}", best.get_output_path().display());

    Ok(())
}
