//! `spectro` command-line front end.
//!
//! Runs the acquisition pipeline against the simulated camera described in the
//! `[simulator]` configuration section.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spectro_daq::config::{SpectrometerConfig, CURRENT_SETTINGS_FILE, DEFAULT_SETTINGS_FILE};
use spectro_daq::storage::{numbered_path, write_image_png, CsvWriter};
use spectro_daq::{logging, ReadoutMode, Spectrometer, SpectrumResult};
use std::path::PathBuf;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "spectro",
    version,
    about = "Line-scan spectrometer acquisition on a simulated ASI183MM"
)]
struct Cli {
    /// Directory holding default_settings.toml and current_settings.toml
    #[arg(long, default_value = "config", global = true)]
    config_dir: PathBuf,

    /// Overwrite current settings with the factory defaults before running
    #[arg(long, global = true)]
    reset_settings: bool,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print camera and settings status
    Status,
    /// Acquire one or more spectra
    Acquire {
        /// Column reduction: average or maximum
        #[arg(long, default_value = "average")]
        mode: ReadoutMode,
        /// Number of spectra
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Save each spectrum as CSV
        #[arg(long)]
        output: Option<PathBuf>,
        /// Save each raw frame as PNG
        #[arg(long)]
        image: Option<PathBuf>,
        /// Print full results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist the active settings as the new factory defaults
    SaveDefaults,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SpectrometerConfig::load_from_dir(&cli.config_dir)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config_dir))?;
    if cli.debug {
        config.application.log_level = "debug".to_string();
    }
    logging::init(&config.application)?;

    if cli.reset_settings {
        let defaults =
            SpectrometerConfig::load_factory_defaults(cli.config_dir.join(DEFAULT_SETTINGS_FILE))
                .context("Failed to load factory defaults")?;
        defaults.save_to(cli.config_dir.join(CURRENT_SETTINGS_FILE))?;
        tracing::info!("Current settings reset to factory defaults");
        config = SpectrometerConfig::load_from_dir(&cli.config_dir)?;
    }

    let camera = Arc::new(config.simulator.build());
    let spectrometer = Spectrometer::new(camera, config.capture_timing());
    spectrometer.apply_defaults(&config.to_defaults()?).await?;

    match cli.command {
        Command::Status => {
            spectrometer.connect().await?;
            let status = spectrometer.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            spectrometer.disconnect().await?;
        }
        Command::Acquire {
            mode,
            count,
            output,
            image,
            json,
        } => {
            spectrometer.connect().await?;
            let outcome = acquire_series(&spectrometer, mode, count, output, image, json).await;
            spectrometer.disconnect().await?;
            outcome?;
        }
        Command::SaveDefaults => {
            let defaults = spectrometer.current_defaults().await;
            let path = config
                .with_defaults(&defaults)
                .save_to(cli.config_dir.join(DEFAULT_SETTINGS_FILE))?;
            println!("Defaults saved to {}", path.display());
        }
    }

    Ok(())
}

async fn acquire_series(
    spectrometer: &Spectrometer,
    mode: ReadoutMode,
    count: usize,
    output: Option<PathBuf>,
    image: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    for index in 0..count {
        let result = spectrometer
            .acquire_spectrum(mode, image.is_some())
            .await
            .with_context(|| format!("Acquisition {} of {count} failed", index + 1))?;

        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_summary(index, &result);
        }

        let target = |base: &PathBuf| {
            if count > 1 {
                numbered_path(base, index)
            } else {
                base.clone()
            }
        };
        if let Some(base) = &output {
            CsvWriter::new(target(base)).write(&result)?;
        }
        if let (Some(base), Some(snapshot)) = (&image, &result.image) {
            write_image_png(target(base), snapshot)?;
        }
    }
    Ok(())
}

fn print_summary(index: usize, result: &SpectrumResult) {
    let peak = result
        .intensities
        .iter()
        .zip(&result.wavelengths)
        .max_by(|a, b| a.0.total_cmp(b.0));
    match peak {
        Some((intensity, wavelength)) => println!(
            "#{index} {} points, {} ms, gain {}, peak {intensity:.1} at {wavelength:.2} nm",
            result.len(),
            result.exposure_ms,
            result.gain
        ),
        None => println!("#{index} empty spectrum"),
    }
}
