//! Error types for the state engine.
//!
//! Every fallible engine operation returns an [`EngineError`]. Callers that
//! only need to decide *what to do next* can match on [`EngineError::kind`]:
//!
//! | Kind           | Meaning                                   | Policy             |
//! |----------------|-------------------------------------------|--------------------|
//! | `Io`           | disk full, write/fsync/rename failure     | retry the whole tx |
//! | `Conservation` | transition would create or destroy value  | report, no retry   |
//! | `Integrity`    | durable state failed verification at boot | halt (SAFE_MODE)   |
//! | `DoubleSpend`  | an input was spent already or twice       | report, no retry   |
//! | `Rejected`     | store refused the request (mode, input)   | report             |
//!
//! Only `Integrity` is fatal.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::commit::CrashPoint;
use crate::conservation::ConservationReport;
use crate::store::DoubleSpendConflict;
use crate::value::ValueError;

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Conservation,
    Integrity,
    DoubleSpend,
    Rejected,
}

/// Durable state could not be verified. Raised only by crash recovery.
#[derive(Debug, Clone, Error)]
pub enum IntegrityViolation {
    /// `state.json` exists but cannot be parsed as a snapshot.
    #[error("state file {path} is corrupt: {detail}")]
    StateCorruption {
        /// Path of the offending snapshot.
        path: PathBuf,
        /// Parser diagnostic.
        detail: String,
    },

    /// The root recomputed from the snapshot entries differs from the root
    /// the snapshot claims.
    #[error("merkle root mismatch: snapshot records {expected}, recomputed {actual}")]
    MerkleRootMismatch {
        /// Hex root stored in the snapshot.
        expected: String,
        /// Hex root recomputed from the entries.
        actual: String,
    },

    /// A WAL record other than the final (possibly torn) one is unreadable.
    #[error("write-ahead log {path} is corrupt at line {line}: {detail}")]
    WalCorruption {
        /// Path of the WAL file.
        path: PathBuf,
        /// 1-based line number of the bad record.
        line: usize,
        /// Parser diagnostic.
        detail: String,
    },
}

impl IntegrityViolation {
    /// Operator-facing next step for this violation.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            IntegrityViolation::StateCorruption { .. } => {
                "restore state.json from the last verified checkpoint or resync from a trusted peer"
            }
            IntegrityViolation::MerkleRootMismatch { .. } => {
                "restore from the last verified checkpoint; do not edit state.json by hand"
            }
            IntegrityViolation::WalCorruption { .. } => {
                "inspect wal.log manually; restore from the last verified checkpoint if unsure"
            }
        }
    }
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A filesystem operation failed. No partial durable effect exists.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory the operation touched.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The transition would change total value.
    #[error("conservation violated: {}", .0.message)]
    ConservationViolation(ConservationReport),

    /// Durable state failed verification. Fatal.
    #[error("integrity violation: {0} (hint: {hint})", hint = .0.recovery_hint())]
    Integrity(IntegrityViolation),

    /// A spent output was offered as an input.
    #[error("double spend: {0}")]
    DoubleSpend(DoubleSpendConflict),

    /// The store is in SAFE_MODE and refuses writes.
    #[error("store is in SAFE_MODE; writes are rejected until restart")]
    SafeMode,

    /// The transition is malformed (empty, reserved key, ...).
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// A value cannot be represented in durable state.
    #[error("invalid value: {0}")]
    InvalidValue(#[from] ValueError),

    /// A configured crash point was reached; the commit was abandoned
    /// mid-flight exactly as a power cut would leave it.
    #[error("simulated crash at {0:?}")]
    SimulatedCrash(CrashPoint),

    /// Metrics registry setup failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl EngineError {
    /// Build an [`EngineError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Io { .. } | EngineError::Serialization(_) => ErrorKind::Io,
            EngineError::ConservationViolation(_) => ErrorKind::Conservation,
            EngineError::Integrity(_) => ErrorKind::Integrity,
            EngineError::DoubleSpend(_) => ErrorKind::DoubleSpend,
            EngineError::SafeMode
            | EngineError::InvalidTransition(_)
            | EngineError::InvalidValue(_)
            | EngineError::SimulatedCrash(_)
            | EngineError::Metrics(_) => ErrorKind::Rejected,
        }
    }

    /// `true` for errors that must keep the store in SAFE_MODE.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Integrity
    }
}

impl From<IntegrityViolation> for EngineError {
    fn from(v: IntegrityViolation) -> Self {
        EngineError::Integrity(v)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Attach a path to raw `io::Result`s.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> EngineResult<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> EngineResult<T> {
        self.map_err(|e| EngineError::io(path, e))
    }
}
