mod bridge;
mod cli;
mod clock;
mod command;
mod config;
mod connection;
mod controller;
mod error;
mod safety;
mod shutdown;
mod telemetry;
mod transport;

use anyhow::{Context, Result};
use bridge::Bridge;
use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use clock::TokioClock;
use config::BridgeConfig;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use transport::{SerialConnector, TcpConnector};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let result = match &cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check { config } => check(config),
        Commands::InitConfig { path } => init_config(path),
    };

    if let Err(ref e) = result {
        error!(error = %e, "Command failed");
    }
    result
}

async fn run(args: &RunArgs) -> Result<()> {
    let mut config = BridgeConfig::load(&args.config)?;
    if let Some(host) = &args.host {
        config.connection.host = host.clone();
    }
    if let Some(port) = args.port {
        config.connection.port = port;
    }
    if let Some(serial_port) = &args.serial_port {
        config.serial.port = serial_port.clone();
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        station = %config.connection.address(),
        serial = %config.serial.port,
        baud = config.serial.baud_rate,
        "Bridge starting"
    );

    let station = TcpConnector::new(config.connection.address());
    let controller = SerialConnector::new(config.serial.port.clone(), config.serial.baud_rate);
    let bridge = Bridge::new(
        Arc::new(config),
        station,
        controller,
        Arc::new(TokioClock::new()),
    );

    bridge.run(shutdown::signal()).await?;
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let config = BridgeConfig::load(path)?;
    info!(
        path = %path.display(),
        station = %config.connection.address(),
        serial = %config.serial.port,
        sensors = config.sensors.len(),
        "Configuration is valid"
    );
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    BridgeConfig::default()
        .save(path)
        .with_context(|| format!("writing defaults to {}", path.display()))?;
    info!(path = %path.display(), "Default configuration written");
    Ok(())
}

/// Initialize logging from the verbosity flags; `RUST_LOG` wins when set
fn init_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if cli.quiet {
        EnvFilter::new("error")
    } else {
        let default_level = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    Ok(())
}
