//! # CLI Interface
//!
//! Defines the command-line argument structure for `verity-node` using
//! `clap` derive. Supports four subcommands: `recover`, `status`, `prove`,
//! and `version`.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Verity state engine operator tool.
///
/// Boots a state store from its data directory, runs crash recovery, and
/// reports what it found. Run it against a stopped node: a store has exactly
/// one writer, and opening it performs recovery.
#[derive(Parser, Debug)]
#[command(
    name = "verity-node",
    about = "Verity state engine operator tool",
    version,
    propagate_version = true
)]
pub struct VerityNodeCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "VERITY_LOG_FORMAT", default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run crash recovery and print the recovery report as JSON.
    ///
    /// Exits non-zero if the store ends up in SAFE_MODE.
    Recover(StoreArgs),
    /// Print mode, root, totals and checkpoints of a store.
    Status(StatusArgs),
    /// Print a Merkle inclusion proof for one key.
    Prove(ProveArgs),
    /// Print version information and exit.
    Version,
}

/// Where the store lives.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Engine configuration file (JSON). Overrides `--data-dir`.
    #[arg(long, short = 'c', env = "VERITY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding `state/` and `wal/`.
    #[arg(long, short = 'd', env = "VERITY_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,
}

/// Arguments for the `status` subcommand.
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Also print the store's Prometheus metrics.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for the `prove` subcommand.
#[derive(Args, Debug)]
pub struct ProveArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Key to prove.
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}
