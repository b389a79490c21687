//! # Write-Ahead Log
//!
//! Append-only journal of in-flight transactions, one JSON record per line:
//!
//! ```text
//! {"tx_id":"tx-1","changes":{"alice":50,"bob":150},"timestamp":1767225600000,"committed":false}
//! {"tx_id":"tx-1","changes":{},"timestamp":1767225600003,"committed":true}
//! ```
//!
//! A transaction's durability state only ever advances by appending: first a
//! PREPARE record (`committed: false`), later a COMMIT record for the same
//! `tx_id`. Nothing is rewritten in place on the commit path, so a commit
//! costs one or two appends no matter how long the log is.
//!
//! The log is compacted lazily by [`WriteAheadLog::truncate_committed`],
//! which rewrites it keeping only PREPAREs that never saw a COMMIT. The
//! rewrite goes through a temp file and a rename, so a crash mid-compaction
//! leaves either the old log or the new one.
//!
//! ## fsync policy
//!
//! - `batch_size = N` coalesces up to N PREPAREs behind one fsync.
//! - `async_fsync = true` hands PREPARE fsyncs to a single background
//!   worker. Failures from the worker surface on the next append.
//! - COMMIT records are always synced inline, which also flushes any
//!   PREPAREs still waiting in a batch.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{WalOptions, WAL_FILE_NAME};
use crate::error::{EngineError, EngineResult, IntegrityViolation, IoContext};
use crate::fsio;
use crate::value::Value;

// ---------------------------------------------------------------------------
// WalEntry
// ---------------------------------------------------------------------------

/// One WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub tx_id: String,
    /// Final values written by the transaction. Empty on COMMIT records.
    pub changes: BTreeMap<String, Value>,
    /// Unix milliseconds at append time.
    pub timestamp: i64,
    pub committed: bool,
}

impl WalEntry {
    fn prepare(tx_id: &str, changes: &BTreeMap<String, Value>) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            changes: changes.clone(),
            timestamp: Utc::now().timestamp_millis(),
            committed: false,
        }
    }

    fn commit(tx_id: &str) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            changes: BTreeMap::new(),
            timestamp: Utc::now().timestamp_millis(),
            committed: true,
        }
    }

    fn to_line(&self) -> EngineResult<String> {
        let mut line =
            serde_json::to_string(self).map_err(|e| EngineError::Serialization(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

// ---------------------------------------------------------------------------
// Background fsync worker
// ---------------------------------------------------------------------------

struct FsyncWorker {
    requests: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<io::Error>>>,
}

impl FsyncWorker {
    fn spawn(path: &Path, file: File) -> EngineResult<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let failure = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&failure);

        let handle = std::thread::Builder::new()
            .name("wal-fsync".to_string())
            .spawn(move || {
                while rx.recv().is_ok() {
                    // coalesce whatever queued up while we were syncing
                    while rx.try_recv().is_ok() {}
                    if let Err(e) = file.sync_data() {
                        *slot.lock() = Some(e);
                    }
                }
            })
            .at(path)?;

        Ok(Self {
            requests: Some(tx),
            handle: Some(handle),
            failure,
        })
    }

    fn request(&self) {
        if let Some(tx) = &self.requests {
            let _ = tx.send(());
        }
    }

    fn take_failure(&self) -> Option<io::Error> {
        self.failure.lock().take()
    }
}

impl Drop for FsyncWorker {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// WriteAheadLog
// ---------------------------------------------------------------------------

/// Append-only durability journal.
pub struct WriteAheadLog {
    path: PathBuf,
    file: File,
    options: WalOptions,
    /// Records written since the last fsync.
    unsynced: usize,
    /// Records currently in the file.
    records: u64,
    /// Bytes of whole records in the file.
    len: u64,
    /// A failed append left bytes past `len` that are not cut yet.
    partial_write: bool,
    /// Fault injection: stop the next record write after this many bytes.
    short_write: Option<usize>,
    /// Pending PREPAREs whose transaction gave up before its rename.
    abandoned: HashSet<String>,
    worker: Option<FsyncWorker>,
}

impl WriteAheadLog {
    /// Open or create `wal.log` inside `dir`.
    pub fn open(dir: &Path, options: WalOptions) -> EngineResult<Self> {
        fsio::ensure_dir(dir)?;
        let path = dir.join(WAL_FILE_NAME);
        let file = fsio::open_append(&path)?;
        let content = fsio::read_optional(&path)?.unwrap_or_default();
        let (lines, tail) = fsio::split_journal(&content);
        let len = (content.len() - tail.len()) as u64;

        // cut a torn final record so the next append starts on a fresh line
        if !tail.is_empty() {
            warn!(path = %path.display(), dropped = tail.len(), "repairing torn wal tail");
            file.set_len(len).at(&path)?;
            file.sync_data().at(&path)?;
        }
        let records = lines.iter().filter(|l| !fsio::is_blank(l)).count() as u64;

        let worker = if options.async_fsync {
            Some(FsyncWorker::spawn(&path, file.try_clone().at(&path)?)?)
        } else {
            None
        };

        debug!(path = %path.display(), records, async_fsync = options.async_fsync, "wal opened");

        Ok(Self {
            path,
            file,
            options,
            unsynced: 0,
            records,
            len,
            partial_write: false,
            short_write: None,
            abandoned: HashSet::new(),
            worker,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> WalOptions {
        self.options
    }

    /// Records currently in the log file.
    pub fn entry_count(&self) -> u64 {
        self.records
    }

    /// Append a PREPARE record for `tx_id`.
    pub fn append_entry(
        &mut self,
        tx_id: &str,
        changes: &BTreeMap<String, Value>,
    ) -> EngineResult<WalEntry> {
        self.check_worker()?;
        let entry = WalEntry::prepare(tx_id, changes);
        self.write_line(&entry.to_line()?)?;

        if self.unsynced >= self.options.batch_size.max(1) {
            match &self.worker {
                Some(worker) => {
                    worker.request();
                    self.unsynced = 0;
                }
                None => self.sync()?,
            }
        }
        Ok(entry)
    }

    /// Append a COMMIT record for `entry` and sync it inline.
    pub fn mark_committed(&mut self, entry: &mut WalEntry) -> EngineResult<()> {
        self.check_worker()?;
        self.write_line(&WalEntry::commit(&entry.tx_id).to_line()?)?;
        self.sync()?;
        entry.committed = true;
        Ok(())
    }

    /// Force every written record to disk.
    pub fn flush(&mut self) -> EngineResult<()> {
        self.check_worker()?;
        self.sync()
    }

    /// Every record in the log, in append order.
    ///
    /// A final line without a trailing newline that fails to parse is a torn
    /// append from a power cut and is skipped. Any other unreadable line is
    /// corruption.
    pub fn read_entries(&self) -> EngineResult<Vec<WalEntry>> {
        let content = match fsio::read_optional(&self.path)? {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let (lines, tail) = fsio::split_journal(&content);

        let mut entries = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if fsio::is_blank(line) {
                continue;
            }
            match serde_json::from_slice::<WalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    return Err(IntegrityViolation::WalCorruption {
                        path: self.path.clone(),
                        line: i + 1,
                        detail: e.to_string(),
                    }
                    .into());
                }
            }
        }
        if !fsio::is_blank(tail) {
            match serde_json::from_slice::<WalEntry>(tail) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "ignoring torn wal tail");
                }
            }
        }
        Ok(entries)
    }

    /// PREPARE records with no matching COMMIT, in append order.
    pub fn uncommitted_entries(&self) -> EngineResult<Vec<WalEntry>> {
        Ok(pending_of(self.read_entries()?))
    }

    /// Forget `tx_id`'s PREPARE at the next truncation. Its transaction
    /// failed before the rename, so there is nothing to recover.
    pub fn abandon(&mut self, tx_id: &str) {
        self.abandoned.insert(tx_id.to_string());
    }

    /// Rewrite the log keeping only still-pending PREPAREs.
    ///
    /// Everything written so far is synced first, so no entry is dropped
    /// before its COMMIT is on disk. Returns the number of records removed.
    pub fn truncate_committed(&mut self) -> EngineResult<u64> {
        self.flush()?;
        let pending: Vec<WalEntry> = self
            .uncommitted_entries()?
            .into_iter()
            .filter(|e| !self.abandoned.contains(&e.tx_id))
            .collect();
        let before = self.records;
        self.rewrite(&pending)?;
        let removed = before.saturating_sub(self.records);
        debug!(removed, kept = self.records, "wal truncated");
        Ok(removed)
    }

    /// Drop every record. Used once recovery has resolved all pending work.
    pub fn clear(&mut self) -> EngineResult<()> {
        self.flush()?;
        self.rewrite(&[])
    }

    /// Write the first half of a PREPARE line with no newline, as a power
    /// cut in the middle of `write(2)` would.
    pub(crate) fn append_torn_entry(
        &mut self,
        tx_id: &str,
        changes: &BTreeMap<String, Value>,
    ) -> EngineResult<()> {
        let line = WalEntry::prepare(tx_id, changes).to_line()?;
        let torn = &line.as_bytes()[..line.len() / 2];
        self.file.write_all(torn).at(&self.path)?;
        self.file.sync_data().at(&self.path)
    }

    /// Fault injection: the next record write stops after `bytes` bytes and
    /// fails, the way `write(2)` does when the disk fills up mid-record.
    pub fn fail_next_write_after(&mut self, bytes: usize) {
        self.short_write = Some(bytes);
    }

    fn write_line(&mut self, line: &str) -> EngineResult<()> {
        self.cut_partial_write()?;
        let bytes = line.as_bytes();
        let written = match self.short_write.take() {
            Some(n) => self.file.write_all(&bytes[..n.min(bytes.len())]).and_then(|()| {
                Err(io::Error::new(io::ErrorKind::Other, "simulated short write"))
            }),
            None => self.file.write_all(bytes),
        };

        if let Err(e) = written {
            // a half record must never be followed by another append
            self.partial_write = true;
            if let Err(cut) = self.cut_partial_write() {
                warn!(
                    path = %self.path.display(),
                    error = %cut,
                    "could not cut partial wal record; retrying before next append"
                );
            }
            return Err(EngineError::io(&self.path, e));
        }
        self.len += bytes.len() as u64;
        self.unsynced += 1;
        self.records += 1;
        Ok(())
    }

    fn cut_partial_write(&mut self) -> EngineResult<()> {
        if self.partial_write {
            self.file.set_len(self.len).at(&self.path)?;
            self.partial_write = false;
            debug!(path = %self.path.display(), len = self.len, "partial wal record cut");
        }
        Ok(())
    }

    fn sync(&mut self) -> EngineResult<()> {
        if self.unsynced > 0 || self.worker.is_some() {
            self.file.sync_data().at(&self.path)?;
        }
        self.unsynced = 0;
        Ok(())
    }

    fn check_worker(&self) -> EngineResult<()> {
        match self.worker.as_ref().and_then(FsyncWorker::take_failure) {
            Some(e) => Err(EngineError::io(&self.path, e)),
            None => Ok(()),
        }
    }

    fn rewrite(&mut self, keep: &[WalEntry]) -> EngineResult<()> {
        let tmp = self.path.with_extension("log.tmp");
        let mut body = String::new();
        for entry in keep {
            body.push_str(&entry.to_line()?);
        }
        fsio::write_synced(&tmp, body.as_bytes())?;
        fs::rename(&tmp, &self.path).at(&self.path)?;
        if let Some(dir) = self.path.parent() {
            fsio::sync_dir(dir)?;
        }

        // the old handle points at the replaced inode
        self.worker = None;
        self.file = fsio::open_append(&self.path)?;
        if self.options.async_fsync {
            self.worker = Some(FsyncWorker::spawn(
                &self.path,
                self.file.try_clone().at(&self.path)?,
            )?);
        }
        self.records = keep.len() as u64;
        self.len = body.len() as u64;
        self.partial_write = false;
        self.unsynced = 0;
        self.abandoned.clear();
        Ok(())
    }
}

fn pending_of(entries: Vec<WalEntry>) -> Vec<WalEntry> {
    let committed: HashSet<String> = entries
        .iter()
        .filter(|e| e.committed)
        .map(|e| e.tx_id.clone())
        .collect();
    entries
        .into_iter()
        .filter(|e| !e.committed && !committed.contains(&e.tx_id))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
