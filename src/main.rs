//! Dredge - passive MongoDB query-shape sniffer
//!
//! This is the main entry point for the Dredge application.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{info, warn, Level};

use dredge::capture;
use dredge::config::{CaptureBackend, DredgeConfig};
use dredge::core::engine::LoopExit;
use dredge::core::DredgeEngine;
use dredge::utils::logger;

/// Command line arguments for Dredge
#[derive(Parser, Debug)]
#[clap(author = "Dredge Team", version, about = "Passively capture MongoDB traffic and report query shapes")]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, default_value = "config/dredge.toml")]
    config: String,

    /// Interface to capture packets from
    #[clap(short, long)]
    interface: Option<String>,

    /// PCAP file to read packets from
    #[clap(short, long)]
    pcap: Option<String>,

    /// BPF filter expression, replaces the derived port filter
    #[clap(short, long)]
    filter: Option<String>,

    /// Capture through the kernel packet ring instead of libpcap
    #[clap(long)]
    ring: bool,

    /// MongoDB server port
    #[clap(long)]
    port: Option<u16>,

    /// Write shape records to this file instead of stdout
    #[clap(short, long)]
    output: Option<String>,

    /// Seconds between statistics reports
    #[clap(long)]
    status_interval: Option<u64>,

    /// List capture interfaces and exit
    #[clap(long)]
    list_interfaces: bool,

    /// Verbose output
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    /// Override configuration with command line arguments
    fn apply(&self, config: &mut DredgeConfig) {
        if let Some(interface) = &self.interface {
            config.capture.interface = Some(interface.clone());
        }
        if let Some(pcap) = &self.pcap {
            config.capture.pcap_file = Some(pcap.clone());
        }
        if let Some(filter) = &self.filter {
            config.capture.bpf_filter = Some(filter.clone());
        }
        if self.ring {
            config.capture.backend = CaptureBackend::Ring;
        }
        if let Some(port) = self.port {
            config.mongodb.port = port;
        }
        if let Some(output) = &self.output {
            config.publish.output = Some(output.clone());
        }
        if let Some(interval) = self.status_interval {
            config.logging.stats_interval = interval;
        }
    }

    fn log_level(&self, config: &DredgeConfig) -> Level {
        match self.verbose {
            0 => logger::parse_level(&config.logging.log_level),
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args: Args = Args::parse();

    if args.list_interfaces {
        for name in capture::list_interfaces().context("Failed to list capture interfaces")? {
            println!("{}", name);
        }
        return Ok(());
    }

    // Load configuration
    let config_found: bool = Path::new(&args.config).exists();
    let mut config: DredgeConfig = if config_found {
        DredgeConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load configuration from {}", args.config))?
    } else {
        DredgeConfig::default()
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    // Initialize logging with configuration
    logger::init_logging(args.log_level(&config), config.logging.format, config.logging.log_file.as_deref())?;

    if config_found {
        info!("Loaded configuration from {}", args.config);
    } else {
        warn!("Configuration file {} not found, using default configuration", args.config);
    }
    info!("Starting Dredge - MongoDB query-shape sniffer");

    // Create and start the Dredge engine
    let mut engine: DredgeEngine = DredgeEngine::new(config);
    engine.start().await?;

    info!("Dredge started successfully");

    // Ctrl-C fires on a signal thread outside the runtime
    let (tx, rx) = oneshot::channel::<()>();
    let tx: Arc<Mutex<Option<oneshot::Sender<()>>>> = Arc::new(Mutex::new(Some(tx)));
    ctrlc::set_handler(move || {
        if let Ok(mut guard) = tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    })
    .context("Error setting Ctrl-C handler")?;

    // Wait for a shutdown signal or the end of the capture
    tokio::select! {
        _ = rx => info!("Shutting down..."),
        exit = engine.wait() => {
            if exit == LoopExit::EndOfStream {
                info!("Capture finished, draining");
            }
        }
    }

    // Stop the engine
    engine.stop().await?;

    info!("Dredge stopped successfully");
    Ok(())
}
