use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parcelsite::geometric::best_choice::BestChoice;
use parcelsite::geometric::ownership::OwnershipJoin;
use parcelsite::geometric::parcel::ParcelSubset;
use parcelsite::geometric::parcel_map::ParcelMap;
use parcelsite::PipelineConfig;

#[derive(Parser)]
#[command(name = "parcelsite")]
#[command(about = "Land-parcel screening for utility-scale solar siting")]
#[command(version)]
struct Cli {
    /// YAML pipeline configuration; built-in defaults when omitted
    #[arg(long, global = true, env = "PARCELSITE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the directory of the rendered maps
    #[arg(long, global = true)]
    solutions_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Step 1: parcels above the size threshold inside the target wards
    Subset {
        #[arg(long)]
        min_hectares: Option<f64>,
    },
    /// Step 2: join CCOD and OCOD company ownership
    Companies {
        /// CSV encoding label (e.g. utf-8, windows-1252)
        #[arg(long)]
        encoding: Option<String>,
    },
    /// Step 3: web map of the parcels
    Map {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        click_popup: bool,
    },
    /// Step 4: best parcels near grid headroom, outside the AONB
    BestChoice {
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also export the selection as GeoJSON
        #[arg(long)]
        geojson: Option<PathBuf>,
        /// Metres to the nearest positive headroom area
        #[arg(long)]
        max_distance: Option<f64>,
        #[arg(long)]
        click_popup: bool,
    },
    /// Look up addresses with the OS Places API
    Geocode {
        #[arg(required = true)]
        addresses: Vec<String>,
        /// File holding the OS Data Hub key; OS_DATA_HUB_API_KEY is used otherwise
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
    /// Steps 1 to 4 in sequence
    Run,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", error_report(&e));
            ExitCode::FAILURE
        }
    }
}

/// Single report of a failure with its chain of causes
fn error_report(e: &anyhow::Error) -> String {
    format!("Error: {:?}", e)
}

fn execute(cli: Cli) -> Result<()> {
    let mut config = match cli.config.as_deref() {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.solutions_dir {
        config.solutions_dir = dir;
    }

    match cli.command {
        Command::Subset { min_hectares } => {
            if let Some(value) = min_hectares {
                config.subset.min_hectares = value;
            }
            subset(&config)
        }
        Command::Companies { encoding } => {
            if encoding.is_some() {
                config.companies.encoding = encoding;
            }
            companies(&config)
        }
        Command::Map {
            output,
            click_popup,
        } => {
            if let Some(path) = output {
                config.map.output_html = path;
            }
            config.map.click_popup |= click_popup;
            parcel_map(&config)
        }
        Command::BestChoice {
            output,
            geojson,
            max_distance,
            click_popup,
        } => {
            if let Some(path) = output {
                config.best_choice.output_html = path;
            }
            if geojson.is_some() {
                config.best_choice.output_geojson = geojson;
            }
            if max_distance.is_some() {
                config.best_choice.max_distance = max_distance;
            }
            config.best_choice.click_popup |= click_popup;
            best_choice(&config)
        }
        Command::Geocode {
            addresses,
            key_file,
        } => geocode(&config, &addresses, key_file),
        Command::Run => {
            subset(&config)?;
            companies(&config)?;
            parcel_map(&config)?;
            best_choice(&config)
        }
    }
}

fn subset(config: &PipelineConfig) -> Result<()> {
    let mut step = ParcelSubset::new(
        config.data_path(&config.subset.parcels),
        config.data_path(&config.subset.wards),
        Some(config.refined_dir().to_string_lossy().to_string()),
        None,
    )?;
    step.set_min_hectares(config.subset.min_hectares);
    step.set_parcels_layer(config.subset.parcels_layer.clone());
    step.set_ward_layer(config.subset.ward_layer.clone());
    step.set_ward_filter(config.subset.ward_filter.clone());

    let path = step.run()?.to_geojson(Some(&config.subset.output_name))?;
    info!("Step 1 done: {}", path.display());
    Ok(())
}

fn companies(config: &PipelineConfig) -> Result<()> {
    let mut step = OwnershipJoin::new(
        config.subset_output(),
        config.data_path(&config.companies.ccod),
        config.data_path(&config.companies.ocod),
        Some(config.refined_dir().to_string_lossy().to_string()),
    )?;
    step.set_registry_filter(config.companies.registry_filter.clone());
    step.set_fields(config.companies.fields.clone());
    step.set_encoding(config.companies.encoding.clone());

    let path = step.run()?.to_geojson(Some(&config.companies.output_name))?;
    info!("Step 2 done: {}", path.display());
    Ok(())
}

fn parcel_map(config: &PipelineConfig) -> Result<()> {
    let output = config.solutions_path(&config.map.output_html);
    let mut step = ParcelMap::new(
        config.companies_output(),
        Some(output.to_string_lossy().to_string()),
    )?;
    step.set_zoom_start(config.map.zoom_start);
    step.set_click_popup(config.map.click_popup);
    step.set_tiles(config.map.tile_layer()?);

    let step = step.run()?;
    step.save()?;
    info!("Step 3 done: {}", step.get_output_path().display());
    Ok(())
}

fn best_choice(config: &PipelineConfig) -> Result<()> {
    let settings = &config.best_choice;
    let output = config.solutions_path(&settings.output_html);
    let mut step = BestChoice::new(
        config.companies_output(),
        config.data_path(&settings.headroom),
        config.data_path(&settings.aonb),
        Some(output.to_string_lossy().to_string()),
    )?;
    step.set_headroom_layer(settings.headroom_layer.clone(), settings.headroom_filter.clone());
    step.set_max_distance(settings.max_distance);
    step.set_tenure_filter(&settings.tenure_filter);
    step.set_click_popup(settings.click_popup);
    step.set_tiles(settings.tile_layer()?);

    let step = step.run()?;
    step.save()?;
    if let Some(path) = settings.output_geojson.as_deref() {
        if step.get_layer().is_some() {
            step.to_geojson(config.data_path(path))?;
        }
    }
    info!("Step 4 done: {}", step.get_output_path().display());
    Ok(())
}

#[cfg(feature = "reqwest")]
fn geocode(config: &PipelineConfig, addresses: &[String], key_file: Option<PathBuf>) -> Result<()> {
    use anyhow::Context;
    use parcelsite::collect::global_variables::{EPSG_BRITISH_NATIONAL_GRID, EPSG_WGS84};
    use parcelsite::collect::os_places::OsPlacesGeocoder;
    use parcelsite::geo_core::GeoCore;

    let key_file = key_file.unwrap_or_else(|| config.solutions_path(&config.geocode.key_file));
    let geocoder = if key_file.is_file() {
        OsPlacesGeocoder::from_key_file(&key_file)?
    } else {
        OsPlacesGeocoder::from_env().context("No API key file and no key in the environment")?
    };

    for address in addresses {
        match geocoder.geocode(address)? {
            Some((x, y)) => {
                let (lon, lat) = GeoCore::transform_coords(EPSG_BRITISH_NATIONAL_GRID, EPSG_WGS84, x, y)?;
                println!("{}\t{:.1}\t{:.1}\t{:.6}\t{:.6}", address, x, y, lon, lat);
            }
            None => println!("{}\t-", address),
        }
    }
    Ok(())
}

#[cfg(not(feature = "reqwest"))]
fn geocode(_config: &PipelineConfig, _addresses: &[String], _key_file: Option<PathBuf>) -> Result<()> {
    anyhow::bail!("Geocoding requires the `reqwest` feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_error_report_lists_each_cause_once() {
        let err = std::fs::read_to_string("/nonexistent/parcelsite.yaml")
            .context("Failed to read configuration /nonexistent/parcelsite.yaml")
            .unwrap_err();
        let report = error_report(&err);
        assert!(report.starts_with("Error: Failed to read configuration"));
        assert_eq!(report.matches("Failed to read configuration").count(), 1);
        assert!(report.contains("Caused by"));
    }

    #[test]
    fn test_cli_parses_best_choice() {
        let cli = Cli::try_parse_from([
            "parcelsite",
            "--data-dir",
            "/srv/norwich",
            "best-choice",
            "--max-distance",
            "1500",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/srv/norwich")));
        match cli.command {
            Command::BestChoice { max_distance, .. } => assert_eq!(max_distance, Some(1500.0)),
            _ => panic!("unexpected command"),
        }
    }
}
