//! Command line arguments

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Bridge between the fire-fighting robot's microcontroller and its control station
#[derive(Parser, Debug)]
#[command(name = "firebot-bridge", author, version, about)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "FIREBOT_VERBOSE")]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the bridge until interrupted
    Run(RunArgs),

    /// Load and validate a configuration file
    Check {
        #[arg(short, long, default_value = "config.toml", env = "FIREBOT_CONFIG")]
        config: PathBuf,
    },

    /// Write a configuration file filled with the defaults
    InitConfig {
        #[arg(default_value = "config.toml")]
        path: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml", env = "FIREBOT_CONFIG")]
    pub config: PathBuf,

    /// Override the control station host
    #[arg(long, env = "FIREBOT_HOST")]
    pub host: Option<String>,

    /// Override the control station port
    #[arg(long, env = "FIREBOT_PORT")]
    pub port: Option<u16>,

    /// Override the serial device path
    #[arg(long, env = "FIREBOT_SERIAL_PORT")]
    pub serial_port: Option<String>,
}
