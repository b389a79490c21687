//! Durable filesystem primitives shared by the WAL, the commit layer and the
//! checkpoint journal.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{EngineResult, IoContext};

/// Create `dir` (and parents) if missing.
pub(crate) fn ensure_dir(dir: &Path) -> EngineResult<()> {
    fs::create_dir_all(dir).at(dir)
}

/// fsync a directory so that renames and unlinks inside it are durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> EngineResult<()> {
    File::open(dir).and_then(|d| d.sync_all()).at(dir)
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> EngineResult<()> {
    Ok(())
}

/// Write `bytes` to a fresh file at `path` and fsync it.
pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> EngineResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .at(path)?;
    file.write_all(bytes).at(path)?;
    file.sync_all().at(path)
}

/// Open `path` for appending, creating it if needed.
pub(crate) fn open_append(path: &Path) -> EngineResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .at(path)
}

/// Read a whole file as raw bytes, treating "not found" as empty.
pub(crate) fn read_optional(path: &Path) -> EngineResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(crate::error::EngineError::io(path, e)),
    }
}

/// Cut the file at `path` back to `len` bytes and fsync it.
pub(crate) fn truncate_synced(path: &Path, len: u64) -> EngineResult<()> {
    let file = OpenOptions::new().write(true).open(path).at(path)?;
    file.set_len(len).at(path)?;
    file.sync_all().at(path)
}

/// Split a line journal into its newline-terminated records and the
/// unterminated tail a torn append leaves behind.
///
/// Works on bytes: a power cut can split a multi-byte UTF-8 character, and
/// only the tail may be cut that way.
pub(crate) fn split_journal(bytes: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let (complete, tail) = bytes.split_at(keep);
    let mut lines: Vec<&[u8]> = complete.split(|b| *b == b'\n').collect();
    // `complete` is empty or ends with '\n'; either way the last piece is empty
    lines.pop();
    (lines, tail)
}

/// `true` for a line holding nothing but whitespace.
pub(crate) fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}
