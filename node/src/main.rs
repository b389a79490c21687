// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Verity Node Operator Tool
//!
//! Entry point for the `verity-node` binary. Parses CLI arguments,
//! initializes logging, boots the state store (which runs crash recovery)
//! and prints what operators need to see.
//!
//! - `recover` — run recovery, print the `RecoveryReport`
//! - `status`  — mode, root, total value, checkpoints
//! - `prove`   — Merkle inclusion proof for one key
//! - `version` — print build version information

mod cli;
mod logging;

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;

use verity_engine::crypto::to_hex;
use verity_engine::{Checkpoint, EngineConfig, RecoveryReport, StateStore};

use cli::{Commands, StoreArgs, VerityNodeCli};

fn main() -> ExitCode {
    let cli = VerityNodeCli::parse();
    logging::init_logging(logging::DEFAULT_FILTER, cli.log_format.into());

    let result = match cli.command {
        Commands::Recover(args) => recover(args),
        Commands::Status(args) => status(args),
        Commands::Prove(args) => prove(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Resolve the engine configuration from a JSON file or the data directory.
fn load_config(args: &StoreArgs) -> Result<EngineConfig> {
    match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid engine config in {}", path.display()))
        }
        None => Ok(EngineConfig::in_dir(&args.data_dir)),
    }
}

fn open_store(args: &StoreArgs) -> Result<StateStore> {
    let config = load_config(args)?;
    tracing::info!(
        state_dir = %config.state_dir.display(),
        wal_dir = %config.wal_dir.display(),
        "opening state store"
    );
    StateStore::open(config).context("failed to open state store")
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs recovery and prints the report. SAFE_MODE is a failure exit.
fn recover(args: StoreArgs) -> Result<()> {
    let store = open_store(&args)?;
    print_json(store.recovery_report())?;
    if !store.is_operational() {
        bail!(
            "store is in {}: {}",
            store.mode(),
            store.recovery_report().errors.join("; ")
        );
    }
    Ok(())
}

/// What `status` prints.
#[derive(Serialize)]
struct StatusView<'a> {
    mode: String,
    transition_count: u64,
    merkle_root: String,
    /// String so totals beyond 64 bits survive JSON consumers.
    total_value: String,
    keys: usize,
    checkpoints: usize,
    latest_checkpoint: Option<&'a Checkpoint>,
    recovery: &'a RecoveryReport,
}

fn status(args: cli::StatusArgs) -> Result<()> {
    let mut store = open_store(&args.store)?;
    let merkle_root = to_hex(&store.get_root_hash());

    print_json(&StatusView {
        mode: store.mode().to_string(),
        transition_count: store.transition_count(),
        merkle_root,
        total_value: store.total_value().to_string(),
        keys: store.get_state_snapshot().len(),
        checkpoints: store.checkpoints().len(),
        latest_checkpoint: store.latest_checkpoint(),
        recovery: store.recovery_report(),
    })?;

    if args.metrics {
        print!("{}", store.metrics().encode()?);
    }
    if !store.is_operational() {
        bail!("store is in {}", store.mode());
    }
    Ok(())
}

fn prove(args: cli::ProveArgs) -> Result<()> {
    let mut store = open_store(&args.store)?;
    if !store.is_operational() {
        bail!("store is in {}; refusing to prove unverified state", store.mode());
    }
    let proof = store
        .get_merkle_proof(&args.key)
        .with_context(|| format!("key {:?} is not in the state", args.key))?;
    debug_assert!(store.verify_merkle_proof(&proof));
    print_json(&proof)
}

/// Prints version information to stdout.
fn print_version() {
    println!("verity-node   {}", env!("CARGO_PKG_VERSION"));
    println!("verity-engine {}", env!("CARGO_PKG_VERSION"));
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}
