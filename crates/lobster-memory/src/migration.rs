//! Upgrade of the legacy `memory/` layout to `.memory/`.
//!
//! ```text
//! memory/MEMORY.md        → .memory/MEMORY.md
//! memory/PROCEDURES.md    → .memory/PROCEDURES.md
//! memory/memory/*.md      → .memory/daily/*.md
//! memory/                 → memory.v1/   (archived once)
//! ```
//!
//! Existing destination files are never overwritten, so running the
//! migration repeatedly is harmless.

use std::path::Path;

use tracing::{error, info};

use crate::errors::Result;

/// Directory holding the current layout.
pub const MEMORY_DIR: &str = ".memory";
/// Legacy directory name.
pub const LEGACY_DIR: &str = "memory";
/// Archive name for the legacy directory.
pub const LEGACY_ARCHIVE_DIR: &str = "memory.v1";

fn copy_if_missing(source: &Path, dest: &Path) -> Result<bool> {
    if !source.is_file() || dest.exists() {
        return Ok(false);
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::copy(source, dest)?;
    Ok(true)
}

fn ensure_file(path: &Path, initial: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    std::fs::write(path, initial)?;
    Ok(true)
}

/// Migrate `root` to the `.memory/` layout. Returns whether anything changed.
pub fn migrate_agent_memory_layout(root: &Path) -> Result<bool> {
    let old = root.join(LEGACY_DIR);
    let new = root.join(MEMORY_DIR);
    let daily = new.join("daily");
    let archive = root.join(LEGACY_ARCHIVE_DIR);
    std::fs::create_dir_all(&daily)?;

    let mut changed = false;
    changed |= copy_if_missing(&old.join("MEMORY.md"), &new.join("MEMORY.md"))?;
    changed |= copy_if_missing(&old.join("PROCEDURES.md"), &new.join("PROCEDURES.md"))?;

    let old_daily = old.join("memory");
    if old_daily.is_dir() {
        let mut notes: Vec<_> = std::fs::read_dir(&old_daily)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        notes.sort();
        for note in notes {
            if let Some(name) = note.file_name() {
                changed |= copy_if_missing(&note, &daily.join(name))?;
            }
        }
    }

    if old.is_dir() && !archive.exists() {
        match std::fs::rename(&old, &archive) {
            Ok(()) => changed = true,
            Err(e) => error!(
                from = %old.display(),
                to = %archive.display(),
                error = %e,
                "could not archive legacy memory directory"
            ),
        }
    }

    changed |= ensure_file(&new.join("MEMORY.md"), "# MEMORY\n\n")?;
    changed |= ensure_file(&new.join("PROCEDURES.md"), "# PROCEDURES\n\n")?;

    if changed {
        info!(root = %root.display(), "migrated memory layout");
    }
    Ok(changed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
