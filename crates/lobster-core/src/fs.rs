//! Crash-safe file replacement.
//!
//! Contents are written to a temp file in the destination's directory,
//! flushed and fsynced, then renamed over the destination. A failure at any
//! step removes the temp file and leaves the destination untouched.

use std::io::Write;
use std::path::Path;

/// Commit step of an atomic write: move the synced temp file into place.
pub type CommitFn = fn(&Path, &Path) -> std::io::Result<()>;

/// Atomically replace `path` with `contents`.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    atomic_write_with(path, contents, |tmp, dest| std::fs::rename(tmp, dest))
}

/// Atomic write with an explicit commit step.
pub fn atomic_write_with(path: &Path, contents: &[u8], commit: CommitFn) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let prefix = path
        .file_name()
        .map(|name| format!("{}.", name.to_string_lossy()))
        .unwrap_or_default();
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    // Dropping the TempPath on error deletes the temp file.
    let tmp_path = tmp.into_temp_path();
    commit(&tmp_path, path)?;
    let _ = tmp_path.keep();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
