//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "filler", version, about = "Multi-station filling machine controller")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/filler_config.toml")]
    pub config: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Replace serial ports with simulated stations built from the configured serial ids
    #[arg(long, action = ArgAction::SetTrue)]
    pub sim: bool,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List candidate serial ports in scan order
    Ports,
    /// Run one handshake pass and report which stations attached
    Scan,
    /// Interactive calibration of one station
    Calibrate {
        /// Slot index of the station (position in [[stations]])
        #[arg(long, value_name = "N")]
        station: usize,
        /// Reference weight in grams (prompted when omitted)
        #[arg(long, value_name = "GRAMS")]
        weight: Option<f32>,
    },
    /// Handshake, run the startup sequence, then start and monitor the fill
    Startup {
        /// Poll stations from a background thread instead of the UI thread
        #[arg(long, action = ArgAction::SetTrue)]
        worker: bool,
    },
    /// Validate config and persisted settings
    SelfCheck,
}
