//! Durable markdown store of permanent procedures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lobster_core::fs::atomic_write;
use parking_lot::Mutex;
use tracing::debug;

use super::codec::{DOCUMENT_HEADER, parse_markdown, to_markdown};
use super::{Procedure, ProcedureStatus};
use crate::errors::Result;

/// `PROCEDURES.md` backed table keyed by normalised trigger.
pub struct ProcedureStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ProcedureStore {
    /// Open a store, creating an empty document if none exists.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            atomic_write(&path, format!("{DOCUMENT_HEADER}\n\n").as_bytes())?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw document text; empty when the file is missing.
    pub fn read_markdown(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the document verbatim.
    pub fn write_markdown(&self, content: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        atomic_write(&self.path, content.as_bytes())?;
        Ok(())
    }

    /// Parsed procedures.
    pub fn list(&self) -> Result<Vec<Procedure>> {
        Ok(parse_markdown(&self.read_markdown()?))
    }

    /// Serialize and replace the whole table.
    pub fn save(&self, procedures: &[Procedure]) -> Result<()> {
        let _guard = self.write_lock.lock();
        atomic_write(&self.path, to_markdown(procedures).as_bytes())?;
        Ok(())
    }

    /// Merge procedures into the table by key.
    ///
    /// On collision the longer step list and the higher weight win, the
    /// status stays permanent if either side is, the original `first_seen`
    /// is kept and `last_seen` takes the incoming date. Items without a
    /// trigger or without steps are skipped.
    pub fn upsert(&self, incoming: &[Procedure]) -> Result<Vec<Procedure>> {
        let _guard = self.write_lock.lock();
        let mut existing = parse_markdown(&self.read_markdown()?);
        let mut index: HashMap<String, usize> = existing
            .iter()
            .enumerate()
            .map(|(i, p)| (p.key(), i))
            .collect();

        for item in incoming {
            if item.key().is_empty() || item.steps.is_empty() {
                continue;
            }
            match index.get(&item.key()) {
                Some(&i) => merge_into(&mut existing[i], item),
                None => {
                    let _ = index.insert(item.key(), existing.len());
                    existing.push(item.clone());
                }
            }
        }

        atomic_write(&self.path, to_markdown(&existing).as_bytes())?;
        debug!(path = %self.path.display(), upserted = incoming.len(), total = existing.len(), "procedures upserted");
        Ok(existing)
    }
}

fn merge_into(current: &mut Procedure, incoming: &Procedure) {
    if incoming.steps.len() > current.steps.len() {
        current.steps.clone_from(&incoming.steps);
    }
    current.weight = current.weight.max(incoming.weight);
    if incoming.status == ProcedureStatus::Permanent {
        current.status = ProcedureStatus::Permanent;
    }
    current.last_seen = incoming.last_seen;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
