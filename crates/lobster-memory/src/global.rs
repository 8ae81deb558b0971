//! Cross-agent memory under `<data_dir>/.memory`.

use std::path::{Path, PathBuf};

use lobster_core::fs::atomic_write;
use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::errors::Result;
use crate::migration::MEMORY_DIR;
use crate::procedures::codec::validate_document;
use crate::procedures::{Procedure, ProcedureStore};

/// User preferences, shared procedures and a knowledge directory.
pub struct GlobalMemoryManager {
    memory_dir: PathBuf,
    user_file: PathBuf,
    knowledge_dir: PathBuf,
    procedures: ProcedureStore,
    procedures_lock: Mutex<()>,
}

impl GlobalMemoryManager {
    /// Open (and create) global memory for `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let memory_dir = data_dir.as_ref().join(MEMORY_DIR);
        let knowledge_dir = memory_dir.join("knowledge");
        std::fs::create_dir_all(&knowledge_dir)?;

        let user_file = memory_dir.join("USER.md");
        if !user_file.exists() {
            atomic_write(&user_file, b"# USER\n\n")?;
        }
        let procedures = ProcedureStore::new(memory_dir.join("PROCEDURES.md"))?;

        Ok(Self {
            memory_dir,
            user_file,
            knowledge_dir,
            procedures,
            procedures_lock: Mutex::new(()),
        })
    }

    /// The `.memory` directory.
    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    /// Contents of `USER.md`.
    pub fn read_user_memory(&self) -> Result<String> {
        Ok(std::fs::read_to_string(&self.user_file)?)
    }

    /// Replace `USER.md`.
    pub fn write_user_memory(&self, content: &str) -> Result<()> {
        atomic_write(&self.user_file, content.as_bytes())?;
        Ok(())
    }

    /// Raw shared `PROCEDURES.md`.
    pub fn read_procedures(&self) -> Result<String> {
        self.procedures.read_markdown()
    }

    /// Replace the shared procedures with a validated document.
    pub fn write_procedures(&self, content: &str) -> Result<()> {
        let parsed = validate_document(content)?;
        let _guard = self.procedures_lock.lock();
        self.procedures.save(&parsed)
    }

    /// Merge procedures into the shared table.
    pub fn upsert_procedures(&self, procedures: &[Procedure]) -> Result<()> {
        let _guard = self.procedures_lock.lock();
        let _ = self.procedures.upsert(procedures)?;
        Ok(())
    }

    /// Shared procedures.
    pub fn list_procedures(&self) -> Result<Vec<Procedure>> {
        self.procedures.list()
    }

    /// Files under `knowledge/`, as sorted relative paths.
    pub fn list_knowledge(&self) -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(&self.knowledge_dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.knowledge_dir)
                    .ok()
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        files.sort();
        files
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MemoryError;
    use crate::procedures::ProcedureStatus;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn creates_defaults() {
        let dir = TempDir::new().unwrap();
        let g = GlobalMemoryManager::new(dir.path()).unwrap();
        assert_eq!(g.read_user_memory().unwrap(), "# USER\n\n");
        assert_eq!(g.read_procedures().unwrap(), "# PROCEDURES\n\n");
        assert!(dir.path().join(".memory/knowledge").is_dir());
    }

    #[test]
    fn user_memory_round_trip() {
        let dir = TempDir::new().unwrap();
        let g = GlobalMemoryManager::new(dir.path()).unwrap();
        g.write_user_memory("# USER\n\nPrefers short answers.\n").unwrap();
        assert!(g.read_user_memory().unwrap().contains("short answers"));
    }

    #[test]
    fn procedures_are_validated_and_upserted() {
        let dir = TempDir::new().unwrap();
        let g = GlobalMemoryManager::new(dir.path()).unwrap();
        assert_matches!(g.write_procedures("nope"), Err(MemoryError::Validation(_)));

        g.write_procedures("## Backup\nTrigger: backup db\nSteps:\n1. dump\n").unwrap();
        let mut extra = Procedure::candidate("rotate keys", vec!["a".into(), "b".into(), "c".into()]);
        extra.status = ProcedureStatus::Permanent;
        g.upsert_procedures(&[extra]).unwrap();

        let triggers: Vec<String> = g.list_procedures().unwrap().into_iter().map(|p| p.trigger).collect();
        assert_eq!(triggers, vec!["backup db", "rotate keys"]);
    }

    #[test]
    fn knowledge_listing_is_sorted_and_relative() {
        let dir = TempDir::new().unwrap();
        let g = GlobalMemoryManager::new(dir.path()).unwrap();
        let knowledge = dir.path().join(".memory/knowledge");
        std::fs::create_dir_all(knowledge.join("infra")).unwrap();
        std::fs::write(knowledge.join("zeta.md"), "z").unwrap();
        std::fs::write(knowledge.join("infra/hosts.md"), "h").unwrap();
        std::fs::write(knowledge.join("alpha.md"), "a").unwrap();
        assert_eq!(g.list_knowledge(), vec!["alpha.md", "infra/hosts.md", "zeta.md"]);
    }
}
