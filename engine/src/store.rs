//! # State Store
//!
//! The public face of the engine. A [`StateStore`] exclusively owns one
//! [`AtomicCommitLayer`] and one [`MerkleTree`] and moves between two modes:
//!
//! ```text
//!              open()
//!                |
//!        recover_from_crash()
//!           /            \
//!        ok               integrity / I/O failure
//!         |                       |
//!    OPERATIONAL  --crash-->  SAFE_MODE   (terminal until restart)
//! ```
//!
//! In OPERATIONAL mode every write goes through the same pipeline:
//!
//! 1. shape checks (keys, representable values, spent inputs)
//! 2. conservation check against the in-memory tree, before any I/O
//! 3. optimistic tree update, new root computed
//! 4. durable commit of the same changes and root
//! 5. on failure the tree mutation is undone, on success the root is
//!    recorded and every `checkpoint_interval` transitions a checkpoint is
//!    finalized
//!
//! A checkpoint whose journal append is lost after the rename is written at
//! the next boot from the recovered state. A failed append halts the store,
//! so the transition count never moves past a missing checkpoint.
//!
//! ## Spent outputs
//!
//! `(txid, output_index)` pairs are tracked in memory and as
//! `spent:<txid>:<index>` keys in the tree itself, so the spent set is
//! authenticated by the root and survives restarts with the snapshot.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointLog};
use crate::commit::{AtomicCommitLayer, RecoveryReport};
use crate::config::{EngineConfig, SPENT_PREFIX};
use crate::conservation::ConservationValidator;
use crate::crypto::{hex_hash, to_hex, Hash};
use crate::error::{EngineError, EngineResult};
use crate::merkle::{MerkleProof, MerkleTree};
use crate::metrics::EngineMetrics;
use crate::transition::{OutputRef, StateTransition};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Modes and outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    /// Writes are rejected. Left only by restarting.
    SafeMode,
    Operational,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreMode::SafeMode => f.write_str("SAFE_MODE"),
            StoreMode::Operational => f.write_str("OPERATIONAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendConflictReason {
    /// The output is already marked spent.
    AlreadySpent,
    /// The same output appears twice in one batch.
    DuplicateInBatch,
}

/// Structured description of a rejected spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleSpendConflict {
    pub output: OutputRef,
    pub reason: SpendConflictReason,
}

impl fmt::Display for DoubleSpendConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            SpendConflictReason::AlreadySpent => write!(f, "output {} is already spent", self.output),
            SpendConflictReason::DuplicateInBatch => {
                write!(f, "output {} is spent twice in one batch", self.output)
            }
        }
    }
}

/// One state in a history offered by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalState {
    pub transition_count: u64,
    pub state: BTreeMap<String, Value>,
}

/// Why an offered history was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum HistoryConflict {
    #[error("offered history is empty")]
    Empty,

    #[error("transition counts must increase: {found} follows {previous}")]
    NonIncreasing { previous: u64, found: u64 },

    #[error("total value at transition {transition_count} is {found}, expected {expected}")]
    ConservationBroken {
        transition_count: u64,
        expected: i128,
        found: i128,
    },

    #[error("state at transition {transition_count} has root {found}, checkpoint has {expected}")]
    CheckpointMismatch {
        transition_count: u64,
        expected: String,
        found: String,
    },
}

/// Result of a durable commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub tx_id: String,
    #[serde(with = "hex_hash")]
    pub merkle_root: Hash,
    pub transition_count: u64,
    /// Set when this commit finalized a checkpoint.
    pub checkpoint: Option<Checkpoint>,
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

pub struct StateStore {
    config: EngineConfig,
    mode: StoreMode,
    commit: AtomicCommitLayer,
    tree: MerkleTree,
    validator: ConservationValidator,
    spent: HashSet<OutputRef>,
    root_history: VecDeque<Hash>,
    checkpoint_log: CheckpointLog,
    checkpoints: Vec<Checkpoint>,
    recovery: RecoveryReport,
    metrics: EngineMetrics,
}

impl StateStore {
    /// Open the store and run crash recovery.
    ///
    /// Recovery failures do not fail `open`: they leave the store in
    /// SAFE_MODE with the cause recorded in [`recovery_report`]. An error is
    /// returned only if the directories cannot be opened at all.
    ///
    /// [`recovery_report`]: Self::recovery_report
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let commit = AtomicCommitLayer::open(
            &config.state_dir,
            &config.wal_dir,
            config.wal,
            config.gc_interval,
        )?;
        let metrics = EngineMetrics::new()?;

        let mut store = Self {
            checkpoint_log: CheckpointLog::new(config.checkpoint_path()),
            tree: MerkleTree::with_cache_capacity(config.merkle_cache_capacity),
            config,
            mode: StoreMode::SafeMode,
            commit,
            validator: ConservationValidator::new(),
            spent: HashSet::new(),
            root_history: VecDeque::new(),
            checkpoints: Vec::new(),
            recovery: RecoveryReport::default(),
            metrics,
        };
        store.boot();
        Ok(store)
    }

    fn boot(&mut self) {
        let started = Instant::now();
        let outcome = self
            .commit
            .recover_from_crash(Some(&mut self.tree))
            .and_then(|report| {
                self.checkpoints = self.checkpoint_log.load()?;
                self.backfill_checkpoint()?;
                Ok(report)
            });

        match outcome {
            Ok(report) => {
                self.recovery = report;
                self.rebuild_spent_set();
                let root = self.tree.get_root_hash();
                self.push_root(root);
                self.mode = StoreMode::Operational;
                info!(
                    root = %to_hex(&root),
                    transitions = self.transition_count(),
                    checkpoints = self.checkpoints.len(),
                    "state store operational"
                );
            }
            Err(e) => {
                self.recovery = RecoveryReport::failed(&e, started);
                self.tree = MerkleTree::with_cache_capacity(self.config.merkle_cache_capacity);
                self.enter_safe_mode(&e);
            }
        }
        self.metrics
            .recovery_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        self.metrics
            .transition_count
            .set(self.transition_count() as i64);
    }

    // -- accessors ---------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn is_operational(&self) -> bool {
        self.mode == StoreMode::Operational
    }

    /// What the boot-time recovery found.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn get_root_hash(&mut self) -> Hash {
        self.tree.get_root_hash()
    }

    /// Every key and value currently held.
    pub fn get_state_snapshot(&self) -> BTreeMap<String, Value> {
        self.tree.snapshot()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.tree.get(key)
    }

    /// Recent roots, oldest first.
    pub fn root_history(&self) -> impl Iterator<Item = &Hash> {
        self.root_history.iter()
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Committed transitions since genesis.
    pub fn transition_count(&self) -> u64 {
        self.commit.durable_snapshot().sequence
    }

    /// Total conserved value of the current state.
    pub fn total_value(&self) -> i128 {
        ConservationValidator::calculate_total_value(&self.tree)
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// The commit layer, for fault injection in tests.
    pub fn commit_layer_mut(&mut self) -> &mut AtomicCommitLayer {
        &mut self.commit
    }

    // -- writes ------------------------------------------------------------

    /// Validate and durably apply `transition`.
    pub fn apply_state_transition(
        &mut self,
        transition: &StateTransition,
    ) -> EngineResult<CommitReceipt> {
        let result = self.check_transition(transition, &[]).and_then(|()| {
            self.commit_changes(transition.changes().clone(), &[])
        });
        self.observe(result)
    }

    /// Like [`apply_state_transition`](Self::apply_state_transition), also
    /// consuming `inputs`. The spent markers are committed in the same atomic
    /// commit as the transition.
    pub fn apply_spending_transition(
        &mut self,
        transition: &StateTransition,
        inputs: &[OutputRef],
    ) -> EngineResult<CommitReceipt> {
        let result = self
            .require_operational()
            .and_then(|()| self.detect_double_spend(inputs).map_err(EngineError::DoubleSpend))
            .and_then(|()| self.check_transition(transition, inputs))
            .and_then(|()| self.commit_changes(transition.changes().clone(), inputs));
        self.observe(result)
    }

    /// Durably mark a single output spent.
    pub fn mark_output_spent(&mut self, output: &OutputRef) -> EngineResult<CommitReceipt> {
        self.apply_spending_transition(&StateTransition::new(), std::slice::from_ref(output))
    }

    pub fn is_output_spent(&self, output: &OutputRef) -> bool {
        self.spent.contains(output)
    }

    /// Check a batch of inputs for reuse.
    pub fn detect_double_spend(&self, inputs: &[OutputRef]) -> Result<(), DoubleSpendConflict> {
        let mut seen = HashSet::with_capacity(inputs.len());
        for output in inputs {
            if self.spent.contains(output) {
                return Err(DoubleSpendConflict {
                    output: output.clone(),
                    reason: SpendConflictReason::AlreadySpent,
                });
            }
            if !seen.insert(output) {
                return Err(DoubleSpendConflict {
                    output: output.clone(),
                    reason: SpendConflictReason::DuplicateInBatch,
                });
            }
        }
        Ok(())
    }

    /// Adopt a peer's state if and only if it hashes to `peer_root`.
    ///
    /// Returns `Ok(false)` on a root mismatch, leaving local state untouched.
    /// On a match the peer state replaces the local one through a durable
    /// commit, so the adoption survives restarts.
    pub fn sync_from_peer(
        &mut self,
        peer_root: &Hash,
        peer_state: BTreeMap<String, Value>,
    ) -> EngineResult<bool> {
        let result = self.adopt_peer_state(peer_root, peer_state);
        match &result {
            Ok(true) => self.metrics.peer_syncs_total.inc(),
            Ok(false) => {}
            Err(e) => {
                self.metrics.record_rejection(e);
                warn!(error = %e, "peer sync failed");
            }
        }
        result
    }

    /// [`sync_from_peer`](Self::sync_from_peer) with a hex-encoded root. A
    /// root that is not 64 hex digits never matches.
    pub fn sync_from_peer_hex(
        &mut self,
        peer_root_hex: &str,
        peer_state: BTreeMap<String, Value>,
    ) -> EngineResult<bool> {
        match crate::crypto::from_hex(peer_root_hex) {
            Some(root) => self.sync_from_peer(&root, peer_state),
            None => {
                warn!(root = peer_root_hex, "peer root is not a 32-byte hex hash");
                Ok(false)
            }
        }
    }

    fn adopt_peer_state(
        &mut self,
        peer_root: &Hash,
        peer_state: BTreeMap<String, Value>,
    ) -> EngineResult<bool> {
        self.require_operational()?;
        for value in peer_state.values() {
            value.check_representable()?;
        }

        let mut candidate =
            MerkleTree::with_cache_capacity(self.config.merkle_cache_capacity);
        candidate.load(peer_state);
        let actual = candidate.get_root_hash();
        if &actual != peer_root {
            warn!(
                claimed = %to_hex(peer_root),
                actual = %to_hex(&actual),
                "peer state rejected: root mismatch"
            );
            return Ok(false);
        }

        let mut tx = self.commit.begin_transaction(&Uuid::new_v4().to_string())?;
        tx.changes = candidate.snapshot();
        tx.replaces_state = true;
        tx.merkle_root_after = Some(actual);
        if let Err(e) = self.commit.commit_transaction(&mut tx) {
            self.after_failed_commit(&e, &mut tx);
            return Err(e);
        }

        self.tree = candidate;
        self.rebuild_spent_set();
        self.finish_commit(actual);
        info!(root = %to_hex(&actual), keys = self.tree.len(), "adopted peer state");
        Ok(true)
    }

    // -- proofs ------------------------------------------------------------

    pub fn get_merkle_proof(&mut self, key: &str) -> Option<MerkleProof> {
        self.tree.generate_proof(key)
    }

    pub fn verify_merkle_proof(&self, proof: &MerkleProof) -> bool {
        MerkleTree::verify_proof(proof)
    }

    // -- long-range attack resistance ---------------------------------------

    /// Check an offered history against conservation and local checkpoints.
    ///
    /// Every state must hold the same total as the first one and as every
    /// local checkpoint. A state at a locally checkpointed transition count
    /// must reproduce that checkpoint's root. Transition counts must be
    /// strictly increasing.
    pub fn validate_state_history(
        &self,
        history: &[HistoricalState],
    ) -> Result<(), HistoryConflict> {
        let first = history.first().ok_or(HistoryConflict::Empty)?;
        let expected_total = self.history_total(first)?;

        let mut previous: Option<u64> = None;
        for entry in history {
            if let Some(prev) = previous {
                if entry.transition_count <= prev {
                    return Err(HistoryConflict::NonIncreasing {
                        previous: prev,
                        found: entry.transition_count,
                    });
                }
            }
            previous = Some(entry.transition_count);

            let total = self.history_total(entry)?;
            if total != expected_total {
                return Err(HistoryConflict::ConservationBroken {
                    transition_count: entry.transition_count,
                    expected: expected_total,
                    found: total,
                });
            }
            if let Some(cp) = self
                .checkpoints
                .iter()
                .find(|cp| cp.conservation_checksum != total)
            {
                return Err(HistoryConflict::ConservationBroken {
                    transition_count: entry.transition_count,
                    expected: cp.conservation_checksum,
                    found: total,
                });
            }

            if let Some(cp) = self
                .checkpoints
                .iter()
                .find(|cp| cp.transition_count == entry.transition_count)
            {
                let root = MerkleTree::from_entries(entry.state.clone()).get_root_hash();
                if root != cp.root_hash {
                    return Err(HistoryConflict::CheckpointMismatch {
                        transition_count: entry.transition_count,
                        expected: to_hex(&cp.root_hash),
                        found: to_hex(&root),
                    });
                }
            }
        }
        Ok(())
    }

    /// `true` if `history` must be refused.
    pub fn reject_alternative_history(&self, history: &[HistoricalState]) -> bool {
        match self.validate_state_history(history) {
            Ok(()) => false,
            Err(conflict) => {
                warn!(%conflict, "alternative history rejected");
                true
            }
        }
    }

    fn history_total(&self, entry: &HistoricalState) -> Result<i128, HistoryConflict> {
        ConservationValidator::total_of(&entry.state).ok_or(HistoryConflict::ConservationBroken {
            transition_count: entry.transition_count,
            expected: self.latest_checkpoint().map_or(0, |cp| cp.conservation_checksum),
            found: i128::MAX,
        })
    }

    // -- internals ---------------------------------------------------------

    fn require_operational(&self) -> EngineResult<()> {
        match self.mode {
            StoreMode::Operational => Ok(()),
            StoreMode::SafeMode => Err(EngineError::SafeMode),
        }
    }

    fn check_transition(
        &self,
        transition: &StateTransition,
        inputs: &[OutputRef],
    ) -> EngineResult<()> {
        self.require_operational()?;
        if transition.is_empty() && inputs.is_empty() {
            return Err(EngineError::InvalidTransition(
                "transition changes nothing".to_string(),
            ));
        }
        transition.check_well_formed()?;

        let report = self.validator.validate_detailed(transition, self.tree.entries());
        if !report.valid {
            return Err(EngineError::ConservationViolation(report));
        }
        Ok(())
    }

    fn commit_changes(
        &mut self,
        mut changes: BTreeMap<String, Value>,
        inputs: &[OutputRef],
    ) -> EngineResult<CommitReceipt> {
        let marker = spent_marker();
        for output in inputs {
            changes.insert(output.spent_key(), marker.clone());
        }

        let started = Instant::now();
        let mut tx = self.commit.begin_transaction(&Uuid::new_v4().to_string())?;

        let undo: Vec<(String, Option<Value>)> = changes
            .keys()
            .map(|k| (k.clone(), self.tree.get(k).cloned()))
            .collect();
        self.tree.batch_update(changes.clone());
        let root = self.tree.get_root_hash();

        tx.changes = changes;
        tx.merkle_root_after = Some(root);
        if let Err(e) = self.commit.commit_transaction(&mut tx) {
            for (key, previous) in undo {
                match previous {
                    Some(value) => self.tree.update(key, value),
                    None => {
                        self.tree.delete(&key);
                    }
                }
            }
            self.after_failed_commit(&e, &mut tx);
            return Err(e);
        }

        self.spent.extend(inputs.iter().cloned());
        self.metrics
            .commit_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        let checkpoint = self.finish_commit(root);

        Ok(CommitReceipt {
            tx_id: tx.tx_id,
            merkle_root: root,
            transition_count: self.transition_count(),
            checkpoint,
        })
    }

    fn after_failed_commit(&mut self, error: &EngineError, tx: &mut crate::commit::Transaction) {
        if let EngineError::SimulatedCrash(_) = error {
            // the commit layer is gone as far as this process is concerned
            self.enter_safe_mode(error);
        } else {
            self.commit.rollback_transaction(tx);
        }
    }

    /// Bookkeeping shared by every successful commit.
    fn finish_commit(&mut self, root: Hash) -> Option<Checkpoint> {
        self.push_root(root);
        self.metrics.commits_total.inc();
        let count = self.transition_count();
        self.metrics.transition_count.set(count as i64);

        let interval = self.config.checkpoint_interval.max(1);
        if count == 0 || count % interval != 0 {
            return None;
        }
        let checkpoint = Checkpoint::new(root, self.total_value(), count);
        if let Err(e) = self.checkpoint_log.append(&checkpoint) {
            // the state at `count` is durable but its checkpoint is not: halt
            // so the next boot journals it from this exact state
            warn!(error = %e, transition_count = count, "checkpoint journal append failed");
            self.enter_safe_mode(&e);
            return None;
        }
        self.checkpoints.push(checkpoint);
        self.metrics.checkpoints_total.inc();
        info!(
            transition_count = count,
            root = %to_hex(&root),
            checksum = %checkpoint.conservation_checksum,
            "checkpoint finalized"
        );
        Some(checkpoint)
    }

    /// Journal the checkpoint owed at the current transition count when a
    /// crash after the rename, or a failed append, left it out of the log.
    fn backfill_checkpoint(&mut self) -> EngineResult<()> {
        let count = self.transition_count();
        let interval = self.config.checkpoint_interval.max(1);
        if count == 0
            || count % interval != 0
            || self.checkpoints.iter().any(|cp| cp.transition_count == count)
        {
            return Ok(());
        }
        let checkpoint = Checkpoint::new(self.tree.get_root_hash(), self.total_value(), count);
        self.checkpoint_log.append(&checkpoint)?;
        self.checkpoints.push(checkpoint);
        self.metrics.checkpoints_total.inc();
        warn!(transition_count = count, "journaled checkpoint missing at boot");
        Ok(())
    }

    fn push_root(&mut self, root: Hash) {
        self.root_history.push_back(root);
        while self.root_history.len() > self.config.root_history_limit.max(1) {
            self.root_history.pop_front();
        }
    }

    fn rebuild_spent_set(&mut self) {
        self.spent = self
            .tree
            .keys_with_prefix(SPENT_PREFIX)
            .filter_map(|k| OutputRef::from_spent_key(k))
            .collect();
    }

    fn enter_safe_mode(&mut self, cause: &EngineError) {
        self.mode = StoreMode::SafeMode;
        self.metrics.safe_mode.set(1);
        error!(error = %cause, "state store entering SAFE_MODE");
    }

    fn observe(&self, result: EngineResult<CommitReceipt>) -> EngineResult<CommitReceipt> {
        match &result {
            Ok(receipt) => debug!(
                tx_id = %receipt.tx_id,
                transition_count = receipt.transition_count,
                "transition applied"
            ),
            Err(e) => {
                self.metrics.record_rejection(e);
                warn!(error = %e, kind = ?e.kind(), "transition rejected");
            }
        }
        result
    }
}

/// Value stored under a `spent:` key. Carries no amount.
fn spent_marker() -> Value {
    Value::Opaque(JsonValue::Bool(true).to_string().into_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CrashPoint;
    use crate::crypto::ZERO_HASH;
    use crate::error::ErrorKind;
    use std::path::Path;

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig {
            checkpoint_interval: 3,
            ..EngineConfig::in_dir(dir)
        }
    }

    fn seeded(dir: &Path) -> StateStore {
        let mut store = StateStore::open(config(dir)).unwrap();
        let mut candidate = MerkleTree::new();
        candidate.update("alice", Value::account(100));
        candidate.update("bob", Value::account(100));
        let root = candidate.get_root_hash();
        assert!(store.sync_from_peer(&root, candidate.snapshot()).unwrap());
        store
    }

    fn transfer(alice: i64, bob: i64) -> StateTransition {
        StateTransition::new()
            .with("alice", Value::account(alice))
            .with("bob", Value::account(bob))
    }

    #[test]
    fn fresh_store_is_operational_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(config(dir.path())).unwrap();
        assert!(store.is_operational());
        assert_eq!(store.transition_count(), 0);
        assert_eq!(store.get_root_hash(), ZERO_HASH);
        assert!(store.recovery_report().recovered);
    }

    #[test]
    fn conserving_transfer_commits() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded(dir.path());
        let receipt = store.apply_state_transition(&transfer(50, 150)).unwrap();

        assert_eq!(receipt.transition_count, 2);
        assert_eq!(store.get("alice"), Some(&Value::account(50)));
        assert_eq!(store.total_value(), 200);
        assert_eq!(store.get_root_hash(), receipt.merkle_root);
    }

    #[test]
    fn non_conserving_transfer_is_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded(dir.path());
        let root = store.get_root_hash();

        let err = store.apply_state_transition(&transfer(100, 200)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conservation);
        assert_eq!(store.get_root_hash(), root);
        assert_eq!(store.transition_count(), 1);
    }

    #[test]
    fn empty_and_reserved_transitions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded(dir.path());
        assert!(matches!(
            store.apply_state_transition(&StateTransition::new()),
            Err(EngineError::InvalidTransition(_))
        ));
        let forged = StateTransition::new().with("spent:tx:0", Value::Number(0));
        assert!(store.apply_state_transition(&forged).is_err());
    }

    #[test]
    fn io_failure_rolls_back_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded(dir.path());
        let root = store.get_root_hash();

        // a plain file where the state directory was makes the temp write fail
        let state_dir = store.config().state_dir.clone();
        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, b"not a directory").unwrap();

        let err = store.apply_state_transition(&transfer(50, 150)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(store.get_root_hash(), root);
        assert_eq!(store.get("alice"), Some(&Value::account(100)));
        assert!(store.is_operational());
        assert_eq!(store.transition_count(), 1);
    }

    #[test]
    fn spending_marks_outputs_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded(dir.path());
        let input = OutputRef::new("funding", 0);

        store
            .apply_spending_transition(&transfer(50, 150), std::slice::from_ref(&input))
            .unwrap();
        assert!(store.is_output_spent(&input));
        assert!(store.get(&input.spent_key()).is_some());

        let err = store
            .apply_spending_transition(&transfer(40, 160), std::slice::from_ref(&input))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DoubleSpend(DoubleSpendConflict {
                reason: SpendConflictReason::AlreadySpent,
                ..
            })
        ));
        assert_eq!(store.get("alice"), Some(&Value::account(50)));
    }

    #[test]
    fn duplicate_inputs_in_one_batch_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded(dir.path());
        let a = OutputRef::new("tx", 1);
        let conflict = store
            .detect_double_spend(&[a.clone(), OutputRef::new("tx", 2), a.clone()])
            .unwrap_err();
        assert_eq!(conflict.output, a);
        assert_eq!(conflict.reason, SpendConflictReason::DuplicateInBatch);
    }

    #[test]
    fn spent_set_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let input = OutputRef::new("ab:cd", 7);
        {
            let mut store = seeded(dir.path());
            store.mark_output_spent(&input).unwrap();
        }
        let store = StateStore::open(config(dir.path())).unwrap();
        assert!(store.is_output_spent(&input));
        assert!(!store.is_output_spent(&OutputRef::new("ab:cd", 8)));
    }

    #[test]
    fn checkpoints_every_interval_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = seeded(dir.path());
            let mut finalized = 0;
            for i in 0..7 {
                let receipt = store.apply_state_transition(&transfer(100 - i, 100 + i)).unwrap();
                if receipt.checkpoint.is_some() {
                    finalized += 1;
                }
            }
            // 8 transitions with an interval of 3
            assert_eq!(finalized, 2);
            assert_eq!(store.checkpoints().len(), 2);
            assert!(store
                .checkpoints()
                .iter()
                .all(|cp| cp.conservation_checksum == 200));
        }
        let store = StateStore::open(config(dir.path())).unwrap();
        let counts: Vec<u64> = store.checkpoints().iter().map(|c| c.transition_count).collect();
        assert_eq!(counts, vec![3, 6]);
    }

    #[test]
    fn checkpoint_lost_after_rename_is_journaled_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let root;
        {
            let mut store = seeded(dir.path());
            store.apply_state_transition(&transfer(90, 110)).unwrap();
            store
                .commit_layer_mut()
                .set_crash_point(Some(CrashPoint::AfterRename));
            // transition 3 is durable, its checkpoint never reached the log
            assert!(store.apply_state_transition(&transfer(80, 120)).is_err());
            assert!(store.checkpoints().is_empty());
        }
        {
            let mut store = StateStore::open(config(dir.path())).unwrap();
            assert!(store.is_operational());
            assert_eq!(store.transition_count(), 3);
            root = store.get_root_hash();
            let cp = *store.latest_checkpoint().unwrap();
            assert_eq!(cp.transition_count, 3);
            assert_eq!(cp.root_hash, root);
            assert_eq!(cp.conservation_checksum, 200);
        }
        // journaled once, not again on every boot
        let store = StateStore::open(config(dir.path())).unwrap();
        assert_eq!(store.checkpoints().len(), 1);
        assert_eq!(store.checkpoints()[0].root_hash, root);
    }

    #[test]
    fn failed_checkpoint_append_halts_until_restart() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = config(dir.path()).checkpoint_path();
        {
            let mut store = seeded(dir.path());
            store.apply_state_transition(&transfer(90, 110)).unwrap();
            // a directory where the journal should be makes the append fail
            std::fs::create_dir(&log_path).unwrap();

            let receipt = store.apply_state_transition(&transfer(80, 120)).unwrap();
            assert_eq!(receipt.transition_count, 3);
            assert!(receipt.checkpoint.is_none());
            assert_eq!(store.mode(), StoreMode::SafeMode);
            assert!(store.apply_state_transition(&transfer(70, 130)).is_err());
        }
        std::fs::remove_dir(&log_path).unwrap();

        let store = StateStore::open(config(dir.path())).unwrap();
        assert!(store.is_operational());
        let counts: Vec<u64> = store.checkpoints().iter().map(|c| c.transition_count).collect();
        assert_eq!(counts, vec![3]);
    }

    #[test]
    fn root_history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(EngineConfig {
            root_history_limit: 4,
            ..config(dir.path())
        })
        .unwrap();
        for i in 0..10 {
            store
                .apply_state_transition(&StateTransition::new().with(format!("memo-{i}"), Value::Number(0)))
                .unwrap();
        }
        let history: Vec<Hash> = store.root_history().copied().collect();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().copied(), Some(store.get_root_hash()));
    }

    #[test]
    fn peer_sync_with_wrong_root_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded(dir.path());
        let before = store.get_state_snapshot();

        let mut peer = BTreeMap::new();
        peer.insert("x".to_string(), Value::Number(1));
        assert!(!store.sync_from_peer(&ZERO_HASH, peer.clone()).unwrap());
        assert!(!store.sync_from_peer_hex("not-hex", peer).unwrap());
        assert_eq!(store.get_state_snapshot(), before);
    }

    #[test]
    fn simulated_crash_halts_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded(dir.path());
        store
            .commit_layer_mut()
            .set_crash_point(Some(CrashPoint::BeforeRename));
        assert!(store.apply_state_transition(&transfer(50, 150)).is_err());
        assert_eq!(store.mode(), StoreMode::SafeMode);
        assert!(matches!(
            store.apply_state_transition(&transfer(50, 150)),
            Err(EngineError::SafeMode)
        ));
    }

    #[test]
    fn safe_mode_is_reported_before_spend_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded(dir.path());
        let input = OutputRef::new("funding", 0);
        store.mark_output_spent(&input).unwrap();

        store
            .commit_layer_mut()
            .set_crash_point(Some(CrashPoint::BeforeWalWrite));
        assert!(store.apply_state_transition(&transfer(50, 150)).is_err());
        assert!(matches!(
            store.apply_spending_transition(&transfer(50, 150), std::slice::from_ref(&input)),
            Err(EngineError::SafeMode)
        ));
    }

    #[test]
    fn corrupt_state_boots_into_safe_mode() {
        let dir = tempfile::tempdir().unwrap();
        {
            seeded(dir.path());
        }
        std::fs::write(config(dir.path()).state_path(), "{{{{").unwrap();

        let mut store = StateStore::open(config(dir.path())).unwrap();
        assert_eq!(store.mode(), StoreMode::SafeMode);
        let report = store.recovery_report();
        assert!(!report.recovered);
        assert!(report.errors[0].contains("corrupt"));
        assert!(store.apply_state_transition(&transfer(50, 150)).is_err());
        assert!(store.metrics().encode().unwrap().contains("verity_safe_mode 1"));
    }

    #[test]
    fn history_must_agree_with_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded(dir.path());
        store.apply_state_transition(&transfer(90, 110)).unwrap();
        store.apply_state_transition(&transfer(80, 120)).unwrap();
        let cp = *store.latest_checkpoint().unwrap();
        assert_eq!(cp.transition_count, 3);

        let state_at = |a: i64, b: i64| -> BTreeMap<String, Value> {
            [("alice", a), ("bob", b)]
                .iter()
                .map(|(k, v)| (k.to_string(), Value::account(*v)))
                .collect()
        };

        let honest = vec![
            HistoricalState { transition_count: 1, state: state_at(100, 100) },
            HistoricalState { transition_count: 3, state: state_at(80, 120) },
        ];
        assert!(store.validate_state_history(&honest).is_ok());
        assert!(!store.reject_alternative_history(&honest));

        let forked = vec![
            HistoricalState { transition_count: 1, state: state_at(100, 100) },
            HistoricalState { transition_count: 3, state: state_at(0, 200) },
        ];
        assert!(matches!(
            store.validate_state_history(&forked),
            Err(HistoryConflict::CheckpointMismatch { transition_count: 3, .. })
        ));

        let inflated = vec![HistoricalState { transition_count: 5, state: state_at(500, 500) }];
        assert!(matches!(
            store.validate_state_history(&inflated),
            Err(HistoryConflict::ConservationBroken { .. })
        ));

        let unordered = vec![
            HistoricalState { transition_count: 3, state: state_at(80, 120) },
            HistoricalState { transition_count: 2, state: state_at(90, 110) },
        ];
        assert!(matches!(
            store.validate_state_history(&unordered),
            Err(HistoryConflict::NonIncreasing { .. })
        ));
        assert_eq!(store.validate_state_history(&[]), Err(HistoryConflict::Empty));
    }
}
