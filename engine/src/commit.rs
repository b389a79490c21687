//! # Atomic Commit Layer
//!
//! Turns a batch of key updates into a durable, all-or-nothing change of
//! `state.json`. The commit path is strictly ordered:
//!
//! ```text
//! 1. WAL PREPARE append (+fsync)          wal.log        += PREPARE
//! 2. load current durable snapshot        (cached copy of state.json)
//! 3. apply tx.changes to a copy
//! 4. write copy to state.<tx_id>.tmp      fsync
//! 5. rename tmp -> state.json             <- the single irrevocable step
//! 6. WAL COMMIT append (+fsync)           wal.log        += COMMIT
//! 7. every gc_interval commits: WAL truncation
//! ```
//!
//! Anything that fails before step 5 leaves `state.json` untouched: the temp
//! file is removed and the I/O error propagates. Once step 5 has happened the
//! commit stands even if step 6 fails: the snapshot records the `tx_id` that
//! produced it, so recovery recognizes the dangling PREPARE and rolls it
//! forward instead of back.
//!
//! ## Recovery
//!
//! [`AtomicCommitLayer::recover_from_crash`] is fail-closed. A snapshot that
//! cannot be parsed, or whose recomputed Merkle root disagrees with the root
//! it records, is an [`IntegrityViolation`]; the caller is expected to halt.
//! No repair is attempted on unverified state.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{is_temp_file_name, temp_file_name, WalOptions, STATE_FILE_NAME};
use crate::crypto::{hex_hash, to_hex, Hash, ZERO_HASH};
use crate::error::{EngineError, EngineResult, IntegrityViolation, IoContext};
use crate::fsio;
use crate::merkle::MerkleTree;
use crate::value::Value;
use crate::wal::WriteAheadLog;

// ---------------------------------------------------------------------------
// CrashPoint
// ---------------------------------------------------------------------------

/// Places in the commit path where a simulated power cut can be injected.
///
/// Reaching an armed point abandons the commit on the spot: nothing is
/// cleaned up, exactly as if the machine lost power. The layer instance must
/// then be discarded and a fresh one recovered from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrashPoint {
    /// Nothing written yet.
    BeforeWalWrite,
    /// Half a PREPARE record on disk.
    DuringWalWrite,
    /// PREPARE durable, no temp file.
    AfterWalWrite,
    /// Half a temp file on disk.
    DuringTempWrite,
    /// Complete temp file, not yet renamed.
    BeforeRename,
    /// Renamed, COMMIT record missing.
    AfterRename,
}

impl CrashPoint {
    pub const ALL: [CrashPoint; 6] = [
        CrashPoint::BeforeWalWrite,
        CrashPoint::DuringWalWrite,
        CrashPoint::AfterWalWrite,
        CrashPoint::DuringTempWrite,
        CrashPoint::BeforeRename,
        CrashPoint::AfterRename,
    ];

    /// `true` if a crash here still leaves the transaction's effect durable.
    pub fn is_past_rename(self) -> bool {
        self == CrashPoint::AfterRename
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Committed,
    RolledBack,
    Failed,
}

/// A unit of work against the durable state. Never persisted as an object;
/// only its WAL records and the resulting snapshot survive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub tx_id: String,
    /// Final values for the keys this transaction writes.
    pub changes: BTreeMap<String, Value>,
    pub merkle_root_before: Option<Hash>,
    /// Root of the state after `changes`. Filled in by the commit if unset.
    pub merkle_root_after: Option<Hash>,
    pub status: TransactionStatus,
    /// Replace the whole snapshot with `changes` instead of merging.
    pub replaces_state: bool,
}

impl Transaction {
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.changes.insert(key.into(), value);
    }
}

// ---------------------------------------------------------------------------
// StateSnapshot
// ---------------------------------------------------------------------------

/// On-disk form of `state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Committed transitions since genesis.
    pub sequence: u64,
    /// Transaction whose rename produced this file.
    pub last_tx_id: Option<String>,
    #[serde(with = "hex_hash")]
    pub merkle_root: Hash,
    pub entries: BTreeMap<String, Value>,
}

impl StateSnapshot {
    /// The state of a store that has never committed anything.
    pub fn genesis() -> Self {
        Self {
            sequence: 0,
            last_tx_id: None,
            merkle_root: ZERO_HASH,
            entries: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// RecoveryReport
// ---------------------------------------------------------------------------

/// Outcome of one boot-time recovery pass, surfaced to operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub recovered: bool,
    pub errors: Vec<String>,
    /// PREPAREs found without a COMMIT.
    pub uncommitted_transactions: usize,
    /// Uncommitted transactions whose effect was discarded.
    pub rolled_back_transactions: usize,
    /// Uncommitted transactions whose rename had already happened.
    pub completed_transactions: usize,
    pub temp_files_cleaned: usize,
    pub merkle_root_verified: bool,
    pub recovery_duration_ms: u64,
    /// `sequence` of the snapshot recovery settled on.
    pub snapshot_sequence: u64,
}

impl RecoveryReport {
    /// Report for a recovery pass that halted on `error`.
    pub fn failed(error: &EngineError, started: Instant) -> Self {
        Self {
            recovered: false,
            errors: vec![error.to_string()],
            recovery_duration_ms: started.elapsed().as_millis() as u64,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// AtomicCommitLayer
// ---------------------------------------------------------------------------

/// Owns `state.json` and the WAL.
pub struct AtomicCommitLayer {
    state_dir: PathBuf,
    state_path: PathBuf,
    wal: WriteAheadLog,
    /// Last snapshot known to be on disk. Valid once `ready`.
    durable: StateSnapshot,
    /// Set by a successful recovery; commits are refused until then.
    ready: bool,
    gc_interval: u64,
    commits_since_gc: u64,
    crash_point: Option<CrashPoint>,
}

impl AtomicCommitLayer {
    /// Open the state and WAL directories. Call
    /// [`recover_from_crash`](Self::recover_from_crash) before committing.
    pub fn open(
        state_dir: &Path,
        wal_dir: &Path,
        wal_options: WalOptions,
        gc_interval: u64,
    ) -> EngineResult<Self> {
        fsio::ensure_dir(state_dir)?;
        let wal = WriteAheadLog::open(wal_dir, wal_options)?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            state_path: state_dir.join(STATE_FILE_NAME),
            wal,
            durable: StateSnapshot::genesis(),
            ready: false,
            gc_interval: gc_interval.max(1),
            commits_since_gc: 0,
            crash_point: None,
        })
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    /// The WAL, for fault injection in tests.
    pub fn wal_mut(&mut self) -> &mut WriteAheadLog {
        &mut self.wal
    }

    /// The snapshot currently on disk.
    pub fn durable_snapshot(&self) -> &StateSnapshot {
        &self.durable
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Arm (or disarm) a simulated power cut.
    pub fn set_crash_point(&mut self, point: Option<CrashPoint>) {
        self.crash_point = point;
    }

    /// Start a transaction. `tx_id` ends up in a file name, so it is limited
    /// to ASCII alphanumerics, `-` and `_`.
    pub fn begin_transaction(&self, tx_id: &str) -> EngineResult<Transaction> {
        let valid = !tx_id.is_empty()
            && tx_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(EngineError::InvalidTransition(format!(
                "transaction id {tx_id:?} is not filename-safe"
            )));
        }
        Ok(Transaction {
            tx_id: tx_id.to_string(),
            changes: BTreeMap::new(),
            merkle_root_before: Some(self.durable.merkle_root),
            merkle_root_after: None,
            status: TransactionStatus::Pending,
            replaces_state: false,
        })
    }

    /// Make `tx` durable, or leave durable state exactly as it was.
    pub fn commit_transaction(&mut self, tx: &mut Transaction) -> EngineResult<()> {
        if !self.ready {
            return Err(EngineError::InvalidTransition(
                "commit refused: crash recovery has not completed".to_string(),
            ));
        }
        if tx.status != TransactionStatus::Pending {
            return Err(EngineError::InvalidTransition(format!(
                "transaction {} is {:?}, not pending",
                tx.tx_id, tx.status
            )));
        }

        match self.commit_steps(tx) {
            Ok(()) => {
                tx.status = TransactionStatus::Committed;
                Ok(())
            }
            Err(EngineError::SimulatedCrash(point)) => {
                tx.status = TransactionStatus::Failed;
                self.ready = false;
                warn!(tx_id = %tx.tx_id, ?point, "simulated crash during commit");
                Err(EngineError::SimulatedCrash(point))
            }
            Err(e) => {
                tx.status = TransactionStatus::Failed;
                self.remove_temp(&tx.tx_id);
                self.wal.abandon(&tx.tx_id);
                warn!(tx_id = %tx.tx_id, error = %e, "commit failed before rename; durable state untouched");
                Err(e)
            }
        }
    }

    /// Discard `tx` without touching durable state.
    pub fn rollback_transaction(&mut self, tx: &mut Transaction) {
        if tx.status == TransactionStatus::Committed {
            warn!(tx_id = %tx.tx_id, "rollback of a committed transaction ignored");
            return;
        }
        self.remove_temp(&tx.tx_id);
        self.wal.abandon(&tx.tx_id);
        tx.status = TransactionStatus::RolledBack;
        debug!(tx_id = %tx.tx_id, "transaction rolled back");
    }

    fn commit_steps(&mut self, tx: &mut Transaction) -> EngineResult<()> {
        // 1. PREPARE
        self.crash_at(CrashPoint::BeforeWalWrite)?;
        if self.crash_point == Some(CrashPoint::DuringWalWrite) {
            self.wal.append_torn_entry(&tx.tx_id, &tx.changes)?;
            return Err(EngineError::SimulatedCrash(CrashPoint::DuringWalWrite));
        }
        let mut entry = self.wal.append_entry(&tx.tx_id, &tx.changes)?;
        self.crash_at(CrashPoint::AfterWalWrite)?;

        // 2-3. durable state + changes
        let mut entries = if tx.replaces_state {
            BTreeMap::new()
        } else {
            self.durable.entries.clone()
        };
        entries.extend(tx.changes.iter().map(|(k, v)| (k.clone(), v.clone())));

        let merkle_root = match tx.merkle_root_after {
            Some(root) => root,
            None => MerkleTree::from_entries(entries.clone()).get_root_hash(),
        };
        tx.merkle_root_after = Some(merkle_root);

        let next = StateSnapshot {
            sequence: self.durable.sequence + 1,
            last_tx_id: Some(tx.tx_id.clone()),
            merkle_root,
            entries,
        };
        let bytes =
            serde_json::to_vec(&next).map_err(|e| EngineError::Serialization(e.to_string()))?;

        // 4. temp file
        let tmp = self.temp_path(&tx.tx_id);
        if self.crash_point == Some(CrashPoint::DuringTempWrite) {
            fsio::write_synced(&tmp, &bytes[..bytes.len() / 2])?;
            return Err(EngineError::SimulatedCrash(CrashPoint::DuringTempWrite));
        }
        fsio::write_synced(&tmp, &bytes)?;
        self.crash_at(CrashPoint::BeforeRename)?;

        // 5. the irrevocable step
        fs::rename(&tmp, &self.state_path).at(&self.state_path)?;
        self.durable = next;
        if let Err(e) = fsio::sync_dir(&self.state_dir) {
            warn!(error = %e, "directory fsync after rename failed");
        }
        self.crash_at(CrashPoint::AfterRename)?;

        // 6. COMMIT. Failure here is repaired by recovery via last_tx_id.
        if let Err(e) = self.wal.mark_committed(&mut entry) {
            warn!(tx_id = %tx.tx_id, error = %e, "wal commit mark failed after rename");
        }

        // 7. lazy GC
        self.commits_since_gc += 1;
        if self.commits_since_gc >= self.gc_interval {
            self.commits_since_gc = 0;
            if let Err(e) = self.wal.truncate_committed() {
                warn!(error = %e, "wal truncation failed; will retry next interval");
            }
        }

        debug!(
            tx_id = %tx.tx_id,
            sequence = self.durable.sequence,
            root = %to_hex(&merkle_root),
            "transaction committed"
        );
        Ok(())
    }

    /// Verify durable state and resolve whatever a crash left behind.
    ///
    /// With `tree`, the tree is loaded from the snapshot and its root is
    /// checked against the snapshot's recorded root.
    pub fn recover_from_crash(
        &mut self,
        tree: Option<&mut MerkleTree>,
    ) -> EngineResult<RecoveryReport> {
        let started = Instant::now();
        self.ready = false;
        let mut report = RecoveryReport::default();

        let snapshot = self.load_snapshot()?;

        if let Some(tree) = tree {
            tree.load(snapshot.entries.clone());
            let actual = tree.get_root_hash();
            if actual != snapshot.merkle_root {
                return Err(IntegrityViolation::MerkleRootMismatch {
                    expected: to_hex(&snapshot.merkle_root),
                    actual: to_hex(&actual),
                }
                .into());
            }
            report.merkle_root_verified = true;
        }

        let pending = self.wal.uncommitted_entries()?;
        report.uncommitted_transactions = pending.len();
        for entry in &pending {
            if snapshot.last_tx_id.as_deref() == Some(entry.tx_id.as_str()) {
                report.completed_transactions += 1;
                info!(tx_id = %entry.tx_id, "rolled forward: rename completed before crash");
            } else {
                report.rolled_back_transactions += 1;
                info!(tx_id = %entry.tx_id, "rolled back uncommitted transaction");
            }
        }

        report.temp_files_cleaned = self.clean_temp_files()?;
        self.wal.clear()?;

        report.snapshot_sequence = snapshot.sequence;
        self.durable = snapshot;
        self.commits_since_gc = 0;
        self.ready = true;

        report.recovered = true;
        report.recovery_duration_ms = started.elapsed().as_millis() as u64;
        info!(
            sequence = report.snapshot_sequence,
            uncommitted = report.uncommitted_transactions,
            rolled_back = report.rolled_back_transactions,
            completed = report.completed_transactions,
            temp_files_cleaned = report.temp_files_cleaned,
            merkle_root_verified = report.merkle_root_verified,
            duration_ms = report.recovery_duration_ms,
            "crash recovery complete"
        );
        Ok(report)
    }

    fn load_snapshot(&self) -> EngineResult<StateSnapshot> {
        match fsio::read_optional(&self.state_path)? {
            None => Ok(StateSnapshot::genesis()),
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| {
                IntegrityViolation::StateCorruption {
                    path: self.state_path.clone(),
                    detail: e.to_string(),
                }
                .into()
            }),
        }
    }

    fn clean_temp_files(&self) -> EngineResult<usize> {
        let mut cleaned = 0;
        for dirent in fs::read_dir(&self.state_dir).at(&self.state_dir)? {
            let dirent = dirent.at(&self.state_dir)?;
            let name = dirent.file_name();
            if name.to_str().is_some_and(is_temp_file_name) {
                let path = dirent.path();
                fs::remove_file(&path).at(&path)?;
                cleaned += 1;
                debug!(path = %path.display(), "removed orphaned temp file");
            }
        }
        if cleaned > 0 {
            fsio::sync_dir(&self.state_dir)?;
        }
        Ok(cleaned)
    }

    fn temp_path(&self, tx_id: &str) -> PathBuf {
        self.state_dir.join(temp_file_name(tx_id))
    }

    fn remove_temp(&self, tx_id: &str) {
        let tmp = self.temp_path(tx_id);
        match fs::remove_file(&tmp) {
            Ok(()) => debug!(path = %tmp.display(), "temp file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %tmp.display(), error = %e, "could not remove temp file"),
        }
    }

    fn crash_at(&self, point: CrashPoint) -> EngineResult<()> {
        if self.crash_point == Some(point) {
            return Err(EngineError::SimulatedCrash(point));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
