//! Append-only JSONL session transcripts.
//!
//! Each session lives in `<sessions_dir>/<sanitized-id>.jsonl`, one
//! [`SessionEntry`] per line. Appends are plain file appends; compaction
//! replaces the whole file through [`SessionStore::rewrite`], which is atomic.
//!
//! ## Locking
//!
//! [`SessionStore::lock_session`] hands out a per-session async guard.
//! Callers that need append + compaction-check to be atomic hold the guard
//! across both steps. Store methods never take the guard themselves, so a
//! holder can call any of them without re-entering the lock. Different
//! sessions never contend.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lobster_core::fs::{CommitFn, atomic_write_with};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::errors::Result;

/// Identifier used when a session id sanitizes to nothing usable.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Role + content of one chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `user`, `assistant`, or `system`.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// A recorded chat message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    /// Append time.
    pub timestamp: DateTime<Utc>,
    /// The message itself.
    pub message: ChatMessage,
    /// Caller-supplied metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl MessageEntry {
    /// Build an entry stamped now.
    pub fn new(role: &str, content: &str, metadata: Option<Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: ChatMessage {
                role: role.to_string(),
                content: content.to_string(),
            },
            metadata,
        }
    }

    /// Lowercased, trimmed role.
    pub fn role(&self) -> String {
        self.message.role.trim().to_lowercase()
    }

    /// Trimmed content.
    pub fn content(&self) -> &str {
        self.message.content.trim()
    }
}

/// Summary record that replaces a compacted span.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    /// Compaction time.
    pub timestamp: DateTime<Utc>,
    /// Concatenated chunk summaries.
    pub summary: String,
    /// Messages folded into the summary.
    pub compacted_messages: usize,
    /// Messages retained verbatim after the record.
    pub kept_messages: usize,
    /// Anchor of the first retained message (`m<index>`, 1-based).
    pub kept_from: String,
}

/// One line of a session file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    /// A chat message.
    Message(MessageEntry),
    /// A compaction summary.
    Compaction(CompactionRecord),
}

impl SessionEntry {
    /// The message, if this entry is one.
    pub fn as_message(&self) -> Option<&MessageEntry> {
        match self {
            Self::Message(m) => Some(m),
            Self::Compaction(_) => None,
        }
    }
}

/// Map a session id onto the safe filename alphabet `[A-Za-z0-9_.-]`.
///
/// `.`, `..` and the empty string collapse to [`DEFAULT_SESSION_ID`].
pub fn sanitize_session_id(session_id: &str) -> String {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        DEFAULT_SESSION_ID.to_string()
    } else {
        sanitized
    }
}

/// JSONL transcript store for one agent.
pub struct SessionStore {
    dir: PathBuf,
    counts: Mutex<HashMap<String, usize>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    commit: CommitFn,
}

impl SessionStore {
    /// Open (and create) a sessions directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counts: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            commit: |tmp, dest| std::fs::rename(tmp, dest),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_commit(mut self, commit: CommitFn) -> Self {
        self.commit = commit;
        self
    }

    /// Directory holding the session files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing a session.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", sanitize_session_id(session_id)))
    }

    /// Acquire the per-session write guard.
    pub async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(sanitize_session_id(session_id))
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Append a message and return the new message count.
    pub fn append(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<usize> {
        let key = sanitize_session_id(session_id);
        let path = self.session_path(session_id);
        let existed_before = path.exists();

        let entry = SessionEntry::Message(MessageEntry::new(role, content, metadata));
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;

        let cached = self.counts.lock().get(&key).copied();
        let count = match cached {
            Some(n) => n + 1,
            None if existed_before => count_messages(&path)?,
            None => 1,
        };
        let _ = self.counts.lock().insert(key, count);
        trace!(session_id, count, "message appended");
        Ok(count)
    }

    /// Every entry in file order. Malformed lines are skipped.
    pub fn read_all(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        read_entries(&self.session_path(session_id))
    }

    /// The last `limit` entries of any type.
    pub fn read_entries(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<SessionEntry>> {
        let entries = self.read_all(session_id)?;
        Ok(tail(entries, limit))
    }

    /// Message entries only, optionally just the last `limit`.
    ///
    /// A full read refreshes the cached count.
    pub fn read_messages(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<MessageEntry>> {
        let messages: Vec<MessageEntry> = self
            .read_all(session_id)?
            .into_iter()
            .filter_map(|entry| match entry {
                SessionEntry::Message(m) => Some(m),
                SessionEntry::Compaction(_) => None,
            })
            .collect();
        if limit.is_none() {
            let _ = self
                .counts
                .lock()
                .insert(sanitize_session_id(session_id), messages.len());
        }
        Ok(tail(messages, limit))
    }

    /// The newest compaction record, if any.
    pub fn read_latest_compaction(&self, session_id: &str) -> Result<Option<CompactionRecord>> {
        Ok(self
            .read_all(session_id)?
            .into_iter()
            .rev()
            .find_map(|entry| match entry {
                SessionEntry::Compaction(record) => Some(record),
                SessionEntry::Message(_) => None,
            }))
    }

    /// Atomically replace a session's contents.
    ///
    /// On failure the previous file is untouched and the error propagates.
    pub fn rewrite(&self, session_id: &str, entries: &[SessionEntry]) -> Result<()> {
        let path = self.session_path(session_id);
        let mut buf = String::new();
        let mut message_count = 0usize;
        for entry in entries {
            if entry.as_message().is_some() {
                message_count += 1;
            }
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        atomic_write_with(&path, buf.as_bytes(), self.commit)?;
        let _ = self
            .counts
            .lock()
            .insert(sanitize_session_id(session_id), message_count);
        debug!(session_id, entries = entries.len(), message_count, "session rewritten");
        Ok(())
    }

    /// Number of message entries, served from cache when possible.
    pub fn message_count(&self, session_id: &str) -> Result<usize> {
        let key = sanitize_session_id(session_id);
        if let Some(n) = self.counts.lock().get(&key).copied() {
            return Ok(n);
        }
        let n = count_messages(&self.session_path(session_id))?;
        let _ = self.counts.lock().insert(key, n);
        Ok(n)
    }

    /// Sorted ids of every stored session.
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(stem) = path.file_stem() {
                    ids.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn tail<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        let skip = items.len().saturating_sub(limit);
        let _ = items.drain(..skip);
    }
    items
}

fn read_entries(path: &Path) -> Result<Vec<SessionEntry>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(error) => trace!(path = %path.display(), %error, "skipping unreadable session line"),
        }
    }
    Ok(entries)
}

fn count_messages(path: &Path) -> Result<usize> {
    Ok(read_entries(path)?
        .iter()
        .filter(|e| e.as_message().is_some())
        .count())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions")).unwrap();
        (dir, store)
    }

    #[test]
    fn sanitize_blocks_traversal() {
        assert_eq!(sanitize_session_id("thread-1"), "thread-1");
        assert_eq!(sanitize_session_id("a/b c"), "a_b_c");
        assert_eq!(sanitize_session_id("."), "default");
        assert_eq!(sanitize_session_id(".."), "default");
        assert_eq!(sanitize_session_id(""), "default");
        assert_eq!(sanitize_session_id("../x"), ".._x");
    }

    proptest! {
        #[test]
        fn sanitized_ids_are_safe_filenames(id in ".{0,40}") {
            let safe = sanitize_session_id(&id);
            prop_assert!(!safe.is_empty());
            prop_assert!(safe != "." && safe != "..");
            prop_assert!(safe.chars().all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c)));
        }
    }

    #[test]
    fn append_and_read_back() {
        let (_dir, store) = store();
        assert_eq!(store.append("s1", "user", "hello", None).unwrap(), 1);
        assert_eq!(
            store
                .append("s1", "assistant", "hi", Some(serde_json::json!({"k": 1})))
                .unwrap(),
            2
        );

        let messages = store.read_messages("s1", None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message.content, "hello");
        assert_eq!(messages[1].metadata, Some(serde_json::json!({"k": 1})));
        assert_eq!(store.read_messages("s1", Some(1)).unwrap()[0].message.content, "hi");
    }

    #[test]
    fn file_format_is_tagged_jsonl() {
        let (_dir, store) = store();
        let _ = store.append("s1", "user", "hello", None).unwrap();
        let raw = std::fs::read_to_string(store.session_path("s1")).unwrap();
        let value: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["message"]["role"], "user");
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn count_survives_restart() {
        let (dir, store) = store();
        for i in 0..3 {
            let _ = store.append("s1", "user", &format!("m{i}"), None).unwrap();
        }
        drop(store);
        let reopened = SessionStore::new(dir.path().join("sessions")).unwrap();
        assert_eq!(reopened.message_count("s1").unwrap(), 3);
        assert_eq!(reopened.append("s1", "user", "m3", None).unwrap(), 4);
    }

    #[test]
    fn rewrite_replaces_and_updates_count() {
        let (_dir, store) = store();
        for i in 0..4 {
            let _ = store.append("s1", "user", &format!("m{i}"), None).unwrap();
        }
        let kept = store.read_messages("s1", Some(1)).unwrap();
        let record = SessionEntry::Compaction(CompactionRecord {
            timestamp: Utc::now(),
            summary: "Chunk 1:\n- stuff".into(),
            compacted_messages: 3,
            kept_messages: 1,
            kept_from: "m4".into(),
        });
        let entries = vec![record, SessionEntry::Message(kept[0].clone())];
        store.rewrite("s1", &entries).unwrap();

        assert_eq!(store.message_count("s1").unwrap(), 1);
        assert_eq!(store.read_all("s1").unwrap(), entries);
        let latest = store.read_latest_compaction("s1").unwrap().unwrap();
        assert_eq!(latest.kept_from, "m4");
    }

    #[test]
    fn failed_rename_leaves_file_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"))
            .unwrap()
            .with_commit(|_tmp, _dest| Err(std::io::Error::other("simulated rename failure")));
        for i in 0..3 {
            let _ = store.append("s1", "user", &format!("m{i}"), None).unwrap();
        }
        let before = std::fs::read(store.session_path("s1")).unwrap();

        let result = store.rewrite("s1", &[]);

        assert!(result.is_err());
        assert_eq!(std::fs::read(store.session_path("s1")).unwrap(), before);
        assert_eq!(store.message_count("s1").unwrap(), 3);
        let leftovers = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (_dir, store) = store();
        let _ = store.append("s1", "user", "ok", None).unwrap();
        let path = store.session_path("s1");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{broken\n[1,2]\n");
        std::fs::write(&path, raw).unwrap();
        assert_eq!(store.read_all("s1").unwrap().len(), 1);
    }

    #[test]
    fn list_sessions_sorted() {
        let (_dir, store) = store();
        let _ = store.append("zeta", "user", "x", None).unwrap();
        let _ = store.append("alpha", "user", "x", None).unwrap();
        assert_eq!(store.list_sessions().unwrap(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn session_locks_are_independent() {
        let (_dir, store) = store();
        let _a = store.lock_session("a").await;
        // A different session must not block.
        let b = tokio::time::timeout(std::time::Duration::from_millis(200), store.lock_session("b")).await;
        assert!(b.is_ok());
        // The same session (after sanitizing) must block while held.
        let same = tokio::time::timeout(std::time::Duration::from_millis(50), store.lock_session("a")).await;
        assert!(same.is_err());
    }
}
