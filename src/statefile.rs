//! Per-entity `KEY=VALUE` state files.
//!
//! These files exist for crash/restart recovery by collaborators; the core
//! treats them as write-only outputs plus one best-effort read during
//! initial VT resolution. Writes go through a temporary file in the same
//! directory followed by an atomic rename, so a crash mid-write never
//! leaves a torn file visible.

use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    path::Path,
};

use tempfile::NamedTempFile;
use tracing::warn;

pub(crate) fn flag(value: bool) -> String {
    String::from(if value { "1" } else { "0" })
}

/// Writes `pairs` to `path`, replacing the previous contents atomically.
///
/// A failed write removes the stale file instead of leaving outdated data
/// visible; the in-memory state stays authoritative either way.
pub(crate) fn save(path: &Path, pairs: &[(&str, String)]) {
    if let Err(err) = write_atomic(path, pairs) {
        warn!(path = %path.display(), "Failed to write state file: {}", err);
        let _ = fs::remove_file(path);
    }
}

fn write_atomic(path: &Path, pairs: &[(&str, String)]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "state file has no parent"))?;

    let mut file = NamedTempFile::new_in(dir)?;
    writeln!(file, "# This is private data. Do not parse.")?;
    for (key, value) in pairs {
        writeln!(file, "{}={}", key, value)?;
    }
    file.flush()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Best-effort read of a previously written state file.
pub(crate) fn load(path: &Path) -> io::Result<HashMap<String, String>> {
    let contents = fs::read_to_string(path)?;
    let mut values = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.to_owned(), value.to_owned());
        }
    }
    Ok(values)
}

pub(crate) fn remove(path: &Path) {
    let _ = fs::remove_file(path);
}
