//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "senscal", version, about = "Motion sensor calibration workflow")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/senscal.toml")]
    pub config: PathBuf,

    /// Log and report as JSON lines instead of pretty text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Knobs shared by every command that drives the workflow loop.
#[derive(clap::Args, Debug, Clone)]
pub struct DriveOpts {
    /// Do not wait for Enter at placement instructions
    #[arg(long, action = ArgAction::SetTrue)]
    pub yes: bool,
    /// Give up after this many calibration rounds
    #[arg(long, value_name = "N", default_value_t = 8)]
    pub max_rounds: u32,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the persisted calibration map and the current step
    Status,
    /// List the motion sensors the configured back-end can see
    Probe,
    /// Run Check → Setup → Run until calibration is done or skipped
    Calibrate {
        #[command(flatten)]
        drive: DriveOpts,
        /// Mark a component as skipped during Check (e.g. lid_gyroscope); repeatable
        #[arg(long, value_name = "COMPONENT")]
        skip: Vec<String>,
    },
    /// Recover after a restart from the recorded workflow state, then continue
    Resume {
        #[command(flatten)]
        drive: DriveOpts,
    },
}
