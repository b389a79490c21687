//! # Engine Configuration & Constants
//!
//! Every tunable of the state engine lives here. Defaults are what a
//! validator should run with; tests shrink intervals to exercise GC and
//! checkpointing without committing thousands of transitions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// On-disk names
// ---------------------------------------------------------------------------

/// Canonical snapshot inside the state directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Temp files are named `state.<tx_id>.tmp`.
pub const TEMP_FILE_PREFIX: &str = "state.";

pub const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Append-only checkpoint journal inside the state directory.
pub const CHECKPOINT_FILE_NAME: &str = "checkpoints.log";

/// Write-ahead log inside the WAL directory.
pub const WAL_FILE_NAME: &str = "wal.log";

/// Reserved key namespace for spent-output markers.
pub const SPENT_PREFIX: &str = "spent:";

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Commits between lazy WAL truncations.
pub const DEFAULT_GC_INTERVAL: u64 = 100;

/// Committed transitions between checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// Recent roots remembered by the store.
pub const DEFAULT_ROOT_HISTORY_LIMIT: usize = 100;

/// Memoized internal Merkle nodes before the cache is flushed.
pub const DEFAULT_MERKLE_CACHE_CAPACITY: usize = 10_000;

/// PREPARE records per fsync. `1` fsyncs every record.
pub const DEFAULT_WAL_BATCH_SIZE: usize = 1;

/// Commit latency budget (p99).
pub const COMMIT_LATENCY_BUDGET_MS: u64 = 5;

/// Boot-time recovery budget for ~100 committed transitions.
pub const RECOVERY_BUDGET_MS: u64 = 200;

// ---------------------------------------------------------------------------
// WalOptions
// ---------------------------------------------------------------------------

/// Durability policy of the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalOptions {
    /// PREPARE records coalesced behind one fsync.
    pub batch_size: usize,
    /// Offload PREPARE fsyncs to a background worker.
    ///
    /// Opt-in. A crash can lose PREPARE records that were written but not
    /// yet synced. COMMIT records and the state file are always synced
    /// inline, so this never produces a partial state.
    pub async_fsync: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_WAL_BATCH_SIZE,
            async_fsync: false,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Everything needed to open a [`StateStore`](crate::store::StateStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding `state.json`, temp files and the checkpoint journal.
    pub state_dir: PathBuf,
    /// Directory holding `wal.log`.
    pub wal_dir: PathBuf,
    pub wal: WalOptions,
    pub gc_interval: u64,
    pub checkpoint_interval: u64,
    pub root_history_limit: usize,
    pub merkle_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("data/state"),
            wal_dir: PathBuf::from("data/wal"),
            wal: WalOptions::default(),
            gc_interval: DEFAULT_GC_INTERVAL,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            root_history_limit: DEFAULT_ROOT_HISTORY_LIMIT,
            merkle_cache_capacity: DEFAULT_MERKLE_CACHE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Default configuration with state and WAL under one data directory.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            state_dir: data_dir.join("state"),
            wal_dir: data_dir.join("wal"),
            ..Self::default()
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.wal_dir.join(WAL_FILE_NAME)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join(CHECKPOINT_FILE_NAME)
    }
}

/// Temp file name used while committing `tx_id`.
pub fn temp_file_name(tx_id: &str) -> String {
    format!("{TEMP_FILE_PREFIX}{tx_id}{TEMP_FILE_SUFFIX}")
}

/// `true` for names produced by [`temp_file_name`].
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with(TEMP_FILE_PREFIX)
        && name.ends_with(TEMP_FILE_SUFFIX)
        && name.len() > TEMP_FILE_PREFIX.len() + TEMP_FILE_SUFFIX.len()
}
