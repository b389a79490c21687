//! # Checkpoints
//!
//! Every `checkpoint_interval` committed transitions the store finalizes a
//! [`Checkpoint`]: the Merkle root and total value at that point. Finalized
//! checkpoints never change. They anchor long-range attack resistance: an
//! alternative history offered by a peer must reproduce every checkpoint it
//! passes through.
//!
//! Checkpoints are journaled to `checkpoints.log`, one JSON object per line,
//! so they survive restarts. The journal is append-only and each append is
//! fsynced before the checkpoint is considered final.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::{hex_hash, Hash};
use crate::error::{EngineResult, IntegrityViolation, IoContext};
use crate::fsio;

/// An immutable `(root, total)` pair at a transition count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "hex_hash")]
    pub root_hash: Hash,
    /// Total conserved value at this point.
    pub conservation_checksum: i128,
    /// Unix milliseconds at finalization.
    pub timestamp: i64,
    /// Committed transitions since genesis.
    pub transition_count: u64,
}

impl Checkpoint {
    pub fn new(root_hash: Hash, conservation_checksum: i128, transition_count: u64) -> Self {
        Self {
            root_hash,
            conservation_checksum,
            timestamp: Utc::now().timestamp_millis(),
            transition_count,
        }
    }
}

/// Append-only journal of finalized checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    path: PathBuf,
}

impl CheckpointLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append `checkpoint`.
    pub fn append(&self, checkpoint: &Checkpoint) -> EngineResult<()> {
        let mut line = serde_json::to_string(checkpoint)
            .map_err(|e| crate::error::EngineError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = fsio::open_append(&self.path)?;
        file.write_all(line.as_bytes()).at(&self.path)?;
        file.sync_data().at(&self.path)?;
        debug!(
            transition_count = checkpoint.transition_count,
            checksum = %checkpoint.conservation_checksum,
            "checkpoint journaled"
        );
        Ok(())
    }

    /// Every journaled checkpoint, oldest first.
    ///
    /// A torn final line is cut from the file so the next append starts on a
    /// fresh line. Any other unreadable line means the journal cannot be
    /// trusted.
    pub fn load(&self) -> EngineResult<Vec<Checkpoint>> {
        let Some(content) = fsio::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let (lines, tail) = fsio::split_journal(&content);

        let mut checkpoints = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if fsio::is_blank(line) {
                continue;
            }
            match serde_json::from_slice::<Checkpoint>(line) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => {
                    return Err(IntegrityViolation::StateCorruption {
                        path: self.path.clone(),
                        detail: format!("line {}: {e}", i + 1),
                    }
                    .into());
                }
            }
        }
        if !tail.is_empty() {
            warn!(path = %self.path.display(), bytes = tail.len(), "cutting torn checkpoint record");
            fsio::truncate_synced(&self.path, (content.len() - tail.len()) as u64)?;
        }
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use crate::error::EngineError;

    #[test]
    fn append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path().join("checkpoints.log"));
        assert!(log.load().unwrap().is_empty());

        let a = Checkpoint::new(sha256(b"a"), 200, 10);
        let b = Checkpoint::new(sha256(b"b"), 200, 20);
        log.append(&a).unwrap();
        log.append(&b).unwrap();

        assert_eq!(log.load().unwrap(), vec![a, b]);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path().join("checkpoints.log"));
        log.append(&Checkpoint::new(sha256(b"a"), 5, 10)).unwrap();

        let mut raw = std::fs::read_to_string(log.path()).unwrap();
        raw.push_str("{\"root_hash\":\"ab");
        std::fs::write(log.path(), raw).unwrap();

        assert_eq!(log.load().unwrap().len(), 1);

        // the next append lands on its own line
        log.append(&Checkpoint::new(sha256(b"b"), 5, 20)).unwrap();
        assert_eq!(log.load().unwrap().len(), 2);
    }

    #[test]
    fn corrupt_middle_record_is_an_integrity_violation() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path().join("checkpoints.log"));
        std::fs::write(log.path(), "not json\n").unwrap();
        log.append(&Checkpoint::new(sha256(b"a"), 5, 10)).unwrap();

        assert!(matches!(log.load(), Err(EngineError::Integrity(_))));
    }
}
