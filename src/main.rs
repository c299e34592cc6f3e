//! CLI Entry Point for xspress3-daq
//!
//! - `run`: arm, start and poll one acquisition, logging every readout
//! - `plan`: print the ordered configuration sequence without touching a device
//! - `info`: print the detector geometry
//! - `provision`: register the two devices and their default properties
//!
//! `run` and `info` talk to the simulated device servers; no live control-system
//! transport ships with this crate.
//!
//! # Usage
//!
//! ```bash
//! xspress3-daq run --config config/default.toml --csv data/run.csv
//! xspress3-daq plan --config config/default.toml
//! xspress3-daq provision --name xspress3 --channels 4 --db devices.json
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, warn};
use xspress3_daq::acquisition::stop_channel;
use xspress3_daq::config::AcquisitionConfig;
use xspress3_daq::logging::{self, OutputFormat, TracingConfig};
use xspress3_daq::provisioning::{self, JsonFileDatabase, ProvisioningRequest};
use xspress3_daq::session::AcquisitionSession;

#[derive(Parser)]
#[command(name = "xspress3-daq")]
#[command(about = "Xspress3 acquisition control and per-frame readout", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "compact", global = true)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure, start and poll one acquisition
    Run {
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Write scaler statistics to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Print the session report as JSON when done
        #[arg(long)]
        json: bool,
    },

    /// Print the configuration sequence without applying it
    Plan {
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Also print the effective configuration as TOML
        #[arg(long)]
        show_config: bool,
    },

    /// Print detector geometry
    Info {
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,
    },

    /// Register the LimaCCDs and Xspress3 devices
    Provision {
        /// Server instance name, usually xspress3
        #[arg(short, long)]
        name: String,

        #[arg(short = 'x', long, default_value = "lima/xspress3/1")]
        detector: String,

        #[arg(short, long, default_value = "lima/limaccd/1")]
        lima: String,

        #[arg(short, long, default_value_t = 1)]
        channels: u32,

        /// JSON device database
        #[arg(long, default_value = "devices.json")]
        db: PathBuf,

        /// Print the actions without applying them
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, csv, json } => run(cli.log_format, config, csv, json).await,
        Commands::Plan {
            config,
            show_config,
        } => plan(config, show_config),
        Commands::Info { config } => info(cli.log_format, config).await,
        Commands::Provision {
            name,
            detector,
            lima,
            channels,
            db,
            dry_run,
        } => {
            init_logging(TracingConfig::default().with_format(cli.log_format))?;
            let request = ProvisioningRequest::new(name)
                .with_channels(channels)
                .with_devices(lima, detector);
            provision(request, db, dry_run).await
        }
    }
}

fn init_logging(config: TracingConfig) -> Result<()> {
    logging::init(config).map_err(anyhow::Error::msg)
}

fn load_config(path: &Path) -> Result<AcquisitionConfig> {
    let config = AcquisitionConfig::load_from(path)?;
    config.validate()?;
    Ok(config)
}

/// Arm and poll one acquisition against the simulated backend.
///
/// No control-system client is bundled. To drive real hardware, build the session
/// with `AcquisitionSession::new` and a `DeviceProxy` for each device instead.
async fn run(
    format: OutputFormat,
    config_path: PathBuf,
    csv: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let mut config = load_config(&config_path)?;
    if csv.is_some() {
        config.output.csv_path = csv;
    }
    init_logging(
        TracingConfig::from_config(&config)
            .map_err(anyhow::Error::msg)?
            .with_format(format),
    )?;

    let (session, _sim) = AcquisitionSession::simulated(config)?;
    let (stop, signal) = stop_channel();
    let ctrl_c = stop.trigger_on_ctrl_c();

    let mut sink = session.default_sink()?;
    let result = session.run(signal, &mut sink).await;
    ctrl_c.abort();

    match result {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{:?}: {} frames, {} readouts, {} failed readouts",
                    report.stop_reason,
                    report.frames_drained,
                    report.readouts,
                    report.readout_failures.len()
                );
            }
            for failure in &report.readout_failures {
                warn!(key = %failure.key, kind = %failure.kind, "{}", failure.message);
            }
            Ok(())
        }
        Err(e) => {
            if e.requires_reset() {
                error!("Devices may need a reset before the next acquisition");
            }
            Err(e.into())
        }
    }
}

fn plan(config_path: PathBuf, show_config: bool) -> Result<()> {
    let config = load_config(&config_path)?;
    if show_config {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    let sequence = xspress3_daq::acquisition::ConfigSequence::from_config(&config);
    for (i, step) in sequence.steps().iter().enumerate() {
        println!("{:>3}  {step}", i + 1);
    }
    Ok(())
}

/// Print the detector geometry. Uses the simulated backend, like `run`.
async fn info(format: OutputFormat, config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(
        TracingConfig::from_config(&config)
            .map_err(anyhow::Error::msg)?
            .with_format(format),
    )?;

    let (session, _sim) = AcquisitionSession::simulated(config)?;
    let info = session.detector_info().await?;
    println!("NumCards     : {}", info.num_cards);
    println!("NumChan      : {}", info.num_channels);
    println!("MaxNumChan   : {}", info.max_num_channels);
    println!("ChansPerCard : {}", info.channels_per_card);
    println!("BinsPerMca   : {}", info.bins_per_mca);
    println!("Card         : {}", info.card);
    Ok(())
}

async fn provision(request: ProvisioningRequest, db: PathBuf, dry_run: bool) -> Result<()> {
    if dry_run {
        request.validate()?;
        for action in request.plan() {
            println!("{action}");
        }
        return Ok(());
    }
    let database = JsonFileDatabase::new(db);
    let applied = provisioning::apply(&request, &database).await?;
    println!("{applied} actions applied to {}", database.path().display());
    Ok(())
}
