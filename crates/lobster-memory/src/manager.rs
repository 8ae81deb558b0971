//! Per-agent memory facade.
//!
//! Layout under the agent directory:
//!
//! ```text
//! .memory/MEMORY.md          free-form notes, bounded to N `##` sections
//! .memory/PROCEDURES.md      permanent procedures
//! .memory/CANDIDATES.json    candidate ledger
//! .memory/daily/<date>.md    daily notes
//! sessions/<id>.jsonl        transcripts
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use lobster_core::fs::atomic_write;
use lobster_core::text::truncate_chars;
use lobster_settings::AgentsSettings;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::compactor::{CompactionConfig, CompactionEngine};
use crate::errors::Result;
use crate::migration::{MEMORY_DIR, migrate_agent_memory_layout};
use crate::procedures::codec::validate_document;
use crate::procedures::{
    CandidateStore, Procedure, ProcedureStore, match_query, merge_procedures, today,
};
use crate::sessions::{CompactionRecord, MessageEntry, SessionEntry, SessionStore};
use crate::summarizer::ChunkSummarizer;

/// Highlights written to the notes per compaction.
pub const FLUSH_MAX_HIGHLIGHTS: usize = 8;
/// Per-highlight length cap.
pub const FLUSH_HIGHLIGHT_MAX_CHARS: usize = 180;

/// Memory tuning for one agent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryConfig {
    /// Compaction and extraction knobs.
    pub compaction: CompactionConfig,
    /// `##` sections retained in `MEMORY.md`.
    pub max_sections: usize,
}

impl MemoryConfig {
    /// Derive from the agents settings section.
    pub fn from_settings(settings: &AgentsSettings) -> Self {
        Self {
            compaction: CompactionConfig::new(
                settings.compact_threshold,
                settings.compact_keep_ratio,
                settings.compact_chunk_size,
                settings.candidate_extract_interval,
            ),
            max_sections: settings.memory_max_sections.max(1),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::from_settings(&AgentsSettings::default())
    }
}

/// Memory for a single agent.
pub struct MemoryManager {
    root: PathBuf,
    memory_dir: PathBuf,
    memory_file: PathBuf,
    daily_dir: PathBuf,
    sessions: Arc<SessionStore>,
    procedures: Arc<ProcedureStore>,
    candidates: Arc<CandidateStore>,
    engine: CompactionEngine,
    max_sections: usize,
    notes_lock: Mutex<()>,
}

impl MemoryManager {
    /// Open (migrating and creating as needed) the memory rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, config: MemoryConfig, summarizer: Arc<dyn ChunkSummarizer>) -> Result<Self> {
        let root = root.into();
        let _ = migrate_agent_memory_layout(&root)?;

        let memory_dir = root.join(MEMORY_DIR);
        let daily_dir = memory_dir.join("daily");
        std::fs::create_dir_all(&daily_dir)?;
        let memory_file = memory_dir.join("MEMORY.md");
        if !memory_file.exists() {
            atomic_write(&memory_file, b"# MEMORY\n\n")?;
        }

        let sessions = Arc::new(SessionStore::new(root.join("sessions"))?);
        let procedures = Arc::new(ProcedureStore::new(memory_dir.join("PROCEDURES.md"))?);
        let candidates = Arc::new(CandidateStore::new(memory_dir.join("CANDIDATES.json"))?);
        let engine = CompactionEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&procedures),
            Arc::clone(&candidates),
            summarizer,
            config.compaction,
        );

        Ok(Self {
            root,
            memory_dir,
            memory_file,
            daily_dir,
            sessions,
            procedures,
            candidates,
            engine,
            max_sections: config.max_sections.max(1),
            notes_lock: Mutex::new(()),
        })
    }

    /// Agent directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `.memory` directory.
    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    /// Transcript store.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    // ── Transcripts ──────────────────────────────────────────────────────

    /// Append a message, then compact or mine candidates.
    ///
    /// The session guard is held for the whole call. When compaction fires
    /// the periodic extraction is skipped for this append. Returns whether
    /// the session was compacted.
    pub async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<bool> {
        let _guard = self.sessions.lock_session(session_id).await;
        let count = self.sessions.append(session_id, role, content, metadata)?;

        let flush = |compacted: &[MessageEntry]| self.flush_compaction(session_id, compacted);
        let compacted = self
            .engine
            .maybe_compact(session_id, Some(count), Some(&flush))
            .await?;
        if !compacted {
            if let Err(e) = self.engine.maybe_extract_candidates(session_id, count) {
                warn!(session_id, error = %e, "periodic candidate extraction failed");
            }
        }
        Ok(compacted)
    }

    fn flush_compaction(&self, session_id: &str, compacted: &[MessageEntry]) -> Result<()> {
        let highlights: Vec<String> = compacted
            .iter()
            .filter(|m| !m.content().is_empty())
            .map(|m| {
                let role = m.role();
                let role = if role.is_empty() { "unknown".to_string() } else { role };
                format!("- {role}: {}", truncate_chars(m.content(), FLUSH_HIGHLIGHT_MAX_CHARS))
            })
            .collect();
        if highlights.is_empty() {
            return Ok(());
        }
        let start = highlights.len().saturating_sub(FLUSH_MAX_HIGHLIGHTS);
        self.append_memory_section(&format!("Compaction {session_id}"), &highlights[start..].join("\n"))
    }

    /// Entries of any type, optionally the last `limit`.
    pub fn read_session(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<SessionEntry>> {
        self.sessions.read_entries(session_id, limit)
    }

    /// Message entries, optionally the last `limit`.
    pub fn read_messages(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<MessageEntry>> {
        self.sessions.read_messages(session_id, limit)
    }

    /// Newest compaction record of a session.
    pub fn read_latest_compaction(&self, session_id: &str) -> Result<Option<CompactionRecord>> {
        self.sessions.read_latest_compaction(session_id)
    }

    /// Stored session ids.
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        self.sessions.list_sessions()
    }

    // ── Notes ────────────────────────────────────────────────────────────

    /// Contents of `MEMORY.md`.
    pub fn read_memory(&self) -> Result<String> {
        Ok(std::fs::read_to_string(&self.memory_file)?)
    }

    /// Replace `MEMORY.md`.
    pub fn write_memory(&self, content: &str) -> Result<()> {
        let _guard = self.notes_lock.lock();
        atomic_write(&self.memory_file, content.as_bytes())?;
        Ok(())
    }

    /// Append a `## title` section, then drop the oldest sections beyond the cap.
    pub fn append_memory_section(&self, title: &str, content: &str) -> Result<()> {
        let _guard = self.notes_lock.lock();
        let existing = match std::fs::read_to_string(&self.memory_file) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let updated = format!("{}\n\n## {title}\n\n{}\n", existing.trim_end(), content.trim());
        let trimmed = trim_sections(&updated, self.max_sections);
        atomic_write(&self.memory_file, trimmed.as_bytes())?;
        debug!(title, "memory section appended");
        Ok(())
    }

    /// Path of the daily note for `day`.
    pub fn daily_note_path(&self, day: NaiveDate) -> PathBuf {
        self.daily_dir.join(format!("{}.md", day.format("%Y-%m-%d")))
    }

    /// Append a line to the daily note (today when `day` is `None`).
    pub fn append_daily_note(&self, text: &str, day: Option<NaiveDate>) -> Result<()> {
        use std::io::Write;
        let path = self.daily_note_path(day.unwrap_or_else(today));
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(format!("{}\n", text.trim()).as_bytes())?;
        Ok(())
    }

    /// Daily note text; empty when none was written.
    pub fn read_daily_note(&self, day: NaiveDate) -> Result<String> {
        match std::fs::read_to_string(self.daily_note_path(day)) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Procedures ───────────────────────────────────────────────────────

    /// Raw `PROCEDURES.md`.
    pub fn read_procedures(&self) -> Result<String> {
        self.procedures.read_markdown()
    }

    /// Replace the permanent procedures with a validated document.
    pub fn write_procedures(&self, content: &str) -> Result<()> {
        let parsed = validate_document(content)?;
        self.procedures.save(&parsed)
    }

    /// Permanent procedures.
    pub fn list_procedures(&self) -> Result<Vec<Procedure>> {
        self.procedures.list()
    }

    /// Every candidate in the ledger.
    pub fn list_candidates(&self) -> Vec<Procedure> {
        self.candidates.list_all()
    }

    /// Procedures relevant to `prompt`.
    ///
    /// Usable candidates are overridden by local permanent procedures, which
    /// in turn override `global` ones.
    pub fn match_procedures(&self, prompt: &str, global: &[Procedure], limit: usize) -> Result<Vec<Procedure>> {
        let local = merge_procedures(&self.candidates.list_usable(), &self.procedures.list()?);
        let merged = merge_procedures(global, &local);
        Ok(match_query(&merged, prompt, limit))
    }
}

/// Keep the newest `max_sections` `## ` sections, preserving the preamble.
pub fn trim_sections(text: &str, max_sections: usize) -> String {
    let mut preamble: Vec<&str> = Vec::new();
    let mut sections: Vec<Vec<&str>> = Vec::new();
    for line in text.lines() {
        if line.starts_with("## ") {
            sections.push(vec![line]);
        } else if let Some(current) = sections.last_mut() {
            current.push(line);
        } else {
            preamble.push(line);
        }
    }
    let max_sections = max_sections.max(1);
    if sections.len() <= max_sections {
        return text.to_string();
    }

    let mut blocks: Vec<String> = Vec::new();
    let head = preamble.join("\n");
    if !head.trim().is_empty() {
        blocks.push(head.trim_end().to_string());
    }
    let skip = sections.len() - max_sections;
    blocks.extend(sections[skip..].iter().map(|s| s.join("\n").trim_end().to_string()));
    format!("{}\n", blocks.join("\n\n"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
