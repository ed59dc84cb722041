use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use polar_rec::commands;
use polar_rec::config::RecorderConfig;
use polar_rec::protocol::service_name;
use polar_rec::recorder::CsvSinkFactory;
use polar_rec::registry::DeviceAssignment;
use polar_rec::transport::btle::BtleTransport;
use polar_rec::transport::Transport;
use polar_rec::types::{DeviceIdentity, Subject};

/// Record heart rate from several Polar sensors at once
#[derive(Parser)]
#[command(name = "polar-rec", version, about, long_about = None)]
struct Cli {
    /// Set the log level to debug
    #[arg(short, long, global = true)]
    debug: bool,

    /// JSON configuration file (devices, timeouts, reconnect policy)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby sensors
    Discover {
        /// Also connect to each sensor and list its services
        #[arg(long)]
        services: bool,
    },

    /// Print the battery level of every configured sensor
    Battery,

    /// Request PPG settings from every sensor and read the PMD data characteristic
    Test,

    /// Read one characteristic from every configured sensor
    Read {
        /// Characteristic UUID, e.g. 00002a19-0000-1000-8000-00805f9b34fb
        uuid: Uuid,
    },

    /// Record heart rate into one CSV file per subject
    Record {
        /// Subject labels; the n-th subject wears the n-th configured sensor
        #[arg(long = "subjects", visible_alias = "sub", num_args = 1..)]
        subjects: Vec<String>,

        /// Phase label, part of each output file name
        #[arg(long, default_value = "0")]
        phase: String,

        /// Directory for the CSV files
        #[arg(long, visible_alias = "output_folder", default_value = ".")]
        output_folder: PathBuf,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,

        /// Also record raw PPG frames
        #[arg(long)]
        ppg: bool,
    },
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_results<T>(
    results: &BTreeMap<DeviceIdentity, polar_rec::Result<T>>,
    show: impl Fn(&T) -> String,
) {
    for (device, result) in results {
        match result {
            Ok(value) => println!("{}: {}", device.name, show(value)),
            Err(e) => println!("{}: error: {e}", device.name),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &cli.config {
        Some(path) => RecorderConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RecorderConfig::default(),
    };
    if let Commands::Record { ppg: true, .. } = cli.command {
        config.record_ppg = true;
    }
    let config = Arc::new(config);

    let transport = Arc::new(
        BtleTransport::new(config.name_prefix.clone())
            .await
            .context("opening Bluetooth adapter")?,
    );

    match cli.command {
        Commands::Discover { services } => {
            let found = commands::discover(transport.as_ref(), config.scan_timeout()).await?;
            for device in &found {
                println!("{}\t{}", device.name, device.id);
            }
            if services && !found.is_empty() {
                let results = commands::list_services(transport, &found, Arc::clone(&config)).await;
                for (device, result) in &results {
                    println!("{}:", device.name);
                    match result {
                        Ok(uuids) => {
                            for uuid in uuids {
                                match service_name(*uuid) {
                                    Some(name) => println!("\t{uuid}  {name}"),
                                    None => println!("\t{uuid}"),
                                }
                            }
                        }
                        Err(e) => println!("\terror: {e}"),
                    }
                }
            }
        }

        Commands::Battery => {
            let assignment = DeviceAssignment::all_devices(&config.devices);
            let results = commands::check_battery(transport, assignment, config).await;
            print_results(&results, |level| format!("{level}%"));
        }

        Commands::Test => {
            let assignment = DeviceAssignment::all_devices(&config.devices);
            let results = commands::test(transport, assignment, config).await;
            print_results(&results, |bytes| hex(bytes));
        }

        Commands::Read { uuid } => {
            let assignment = DeviceAssignment::all_devices(&config.devices);
            let results = commands::read_service(transport, assignment, uuid, config).await;
            print_results(&results, |bytes| hex(bytes));
        }

        Commands::Record {
            subjects,
            phase,
            output_folder,
            duration,
            ..
        } => {
            let subjects: Vec<Subject> = subjects.into_iter().map(Subject::new).collect();
            let assignment = DeviceAssignment::new(&config.devices, &subjects)?;

            let stop = CancellationToken::new();
            let on_signal = stop.clone();
            tokio::spawn(async move {
                match duration {
                    Some(secs) => {
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => {}
                            _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                                info!("{secs} s elapsed");
                            }
                        }
                    }
                    None => {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            warn!("cannot listen for Ctrl-C: {e}");
                            return;
                        }
                    }
                }
                on_signal.cancel();
            });

            let factory = Arc::new(CsvSinkFactory::new(&output_folder, chrono::Utc::now()));
            let transport: Arc<dyn Transport> = transport;
            let report =
                commands::record(transport, assignment, &phase, factory, config, stop).await?;

            for subject in &report.subjects {
                match &subject.first_error {
                    None => println!("{}: {} record(s)", subject.subject, subject.written),
                    Some(e) => println!(
                        "{}: {} record(s), {} failed ({e})",
                        subject.subject, subject.written, subject.failed
                    ),
                }
            }
            for device in &report.lost {
                println!("lost: {device}");
            }
        }
    }

    Ok(())
}
