use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use flowtap::config::Config;
use flowtap::protocols::ProtocolRegistry;
use flowtap::publish::StdoutPublisher;
use flowtap::sniffer::{self, CaptureSource, PcapFileSource};
use flowtap::Sniffer;

#[derive(Parser)]
#[command(name = "flowtap")]
#[command(author, version, about = "Flow and ICMP transaction tracker for captured traffic")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture from the source in the [capture] config section
    Run,

    /// Replay a pcap file
    Replay {
        /// pcap file to read
        file: PathBuf,
    },

    /// Capture live on an interface (needs the `live` feature)
    Live {
        /// Interface name
        interface: String,
    },

    /// Validate the configuration and print the port assignments
    CheckConfig,

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run => {
            let source = sniffer::open_source(&config.capture)?;
            cmd_capture(config, source).await
        }
        Commands::Replay { file } => {
            let source = PcapFileSource::open(&file)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            cmd_capture(config, Box::new(source)).await
        }
        Commands::Live { interface } => {
            let mut capture = config.capture.clone();
            capture.file = None;
            capture.interface = Some(interface);
            let source = sniffer::open_source(&capture)?;
            cmd_capture(config, source).await
        }
        Commands::CheckConfig => cmd_check_config(config),
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

async fn cmd_capture(config: Config, source: Box<dyn CaptureSource>) -> Result<()> {
    let registry = ProtocolRegistry::from_config(&config);
    let pipeline = Sniffer::new(config, registry, Arc::new(StdoutPublisher))
        .context("Failed to set up capture pipeline")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let run = pipeline.run(source, stop_rx);
    tokio::pin!(run);

    let summary = tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            let _ = stop_tx.send(true);
            run.await?
        }
    };

    eprintln!(
        "{} frames, {} dropped by decoder, {} dropped by kernel",
        summary.decoder.frames, summary.decoder.dropped, summary.capture.dropped
    );
    Ok(())
}

fn cmd_check_config(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let registry = ProtocolRegistry::from_config(&config);

    println!("Configuration OK");
    println!(
        "  flows: {} (timeout {:?}, period {:?})",
        if config.flows.enabled { "enabled" } else { "disabled" },
        config.flows.timeout,
        config.flows.period
    );
    println!(
        "  icmp: {} (transaction timeout {:?})",
        if config.icmp.enabled { "enabled" } else { "disabled" },
        config.icmp.transaction_timeout
    );
    for reg in registry.iter() {
        println!(
            "  {}: tcp {:?}, udp {:?}",
            reg.protocol, reg.tcp_ports, reg.udp_ports
        );
    }
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();

    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
