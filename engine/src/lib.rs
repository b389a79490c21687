// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Verity — Consensus State Engine
//!
//! The part of Verity that has to be right when the power goes out: a
//! crash-safe, Merkle-authenticated key-value store that refuses to let value
//! appear from nowhere or vanish into it.
//!
//! Three guarantees, in order of how much sleep they cost us:
//!
//! 1. **Atomic durability.** A transition is either fully on disk or not at
//!    all, across process crashes and power cuts. WAL first, temp file,
//!    fsync, one atomic rename.
//! 2. **Conservation.** The total of every balance in the store never
//!    changes. Transitions that mint or burn are rejected before touching
//!    the disk.
//! 3. **Tamper evidence.** The whole state hashes to a single Merkle root,
//!    checked at every boot. If it doesn't verify, we don't run.
//!
//! ## Architecture
//!
//! - **value** — The tagged `Value` type and how much each value is worth.
//! - **transition** — Batches of key updates and spendable output refs.
//! - **merkle** — SHA-256 Merkle tree with lazy rebuilds and inclusion proofs.
//! - **conservation** — The no-free-money check.
//! - **wal** — Append-only write-ahead log.
//! - **commit** — Two-phase durable commit and fail-closed crash recovery.
//! - **checkpoint** — Immutable `(root, total)` anchors every N transitions.
//! - **store** — The façade: modes, double-spend tracking, peer sync.
//! - **metrics** — Prometheus counters and histograms per store.
//! - **config** — Tunables and on-disk names.
//! - **error** — One error type, five kinds, one of them fatal.
//!
//! ## Quick tour
//!
//! ```no_run
//! use verity_engine::{EngineConfig, StateStore, StateTransition, Value};
//!
//! # fn main() -> Result<(), verity_engine::EngineError> {
//! let mut store = StateStore::open(EngineConfig::in_dir("/var/lib/verity"))?;
//! assert!(store.is_operational());
//!
//! let transfer = StateTransition::new()
//!     .with("alice", Value::account(50))
//!     .with("bob", Value::account(150));
//! let receipt = store.apply_state_transition(&transfer)?;
//! println!("root after commit: {}", verity_engine::crypto::to_hex(&receipt.merkle_root));
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod conservation;
pub mod crypto;
pub mod error;
mod fsio;
pub mod merkle;
pub mod metrics;
pub mod store;
pub mod transition;
pub mod value;
pub mod wal;

pub use checkpoint::{Checkpoint, CheckpointLog};
pub use commit::{
    AtomicCommitLayer, CrashPoint, RecoveryReport, StateSnapshot, Transaction, TransactionStatus,
};
pub use config::{EngineConfig, WalOptions};
pub use conservation::{ConservationReport, ConservationValidator};
pub use crypto::{Hash, ZERO_HASH};
pub use error::{EngineError, EngineResult, ErrorKind, IntegrityViolation};
pub use merkle::{MerkleProof, MerkleTree};
pub use metrics::EngineMetrics;
pub use store::{
    CommitReceipt, DoubleSpendConflict, HistoricalState, HistoryConflict, SpendConflictReason,
    StateStore, StoreMode,
};
pub use transition::{OutputRef, StateChange, StateTransition};
pub use value::{Conserved, Value, ValueError};
pub use wal::{WalEntry, WriteAheadLog};
