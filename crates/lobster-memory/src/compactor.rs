//! Session auto-compaction.
//!
//! When a session reaches the configured threshold, the oldest messages are
//! summarized chunk by chunk and the file is atomically rewritten as
//! `[compaction record, ...kept tail]`.
//!
//! ## Ordering
//!
//! 1. Cheap cached-count precheck, then a full read and re-check.
//! 2. Summarize the compacted head (per-chunk fallback on failure).
//! 3. Rewrite the session. Errors here propagate and leave the file as it was.
//! 4. Post-commit side effects: the flush callback, then candidate mining.
//!    Failures are logged and never undo the rewrite.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::procedures::{CandidateStore, Procedure, ProcedureStore, extract_candidates};
use crate::sessions::{CompactionRecord, MessageEntry, SessionEntry, SessionStore};
use crate::summarizer::{ChunkSummarizer, fallback_chunk_summary, normalize_summary};

/// Summary stored when every chunk produced nothing.
pub const EMPTY_SUMMARY: &str = "(no compaction summary)";

/// Callback receiving the compacted messages after a successful rewrite.
pub type FlushFn<'a> = dyn Fn(&[MessageEntry]) -> Result<()> + Send + Sync + 'a;

/// Compaction knobs, clamped to sane ranges on construction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompactionConfig {
    /// Message count that triggers compaction (≥ 1).
    pub threshold: usize,
    /// Fraction of messages kept verbatim, in `[0.05, 0.9]`.
    pub keep_ratio: f64,
    /// Messages per summarizer call (≥ 1).
    pub chunk_size: usize,
    /// Appends between periodic candidate extractions (≥ 1).
    pub extract_interval: usize,
}

impl CompactionConfig {
    /// Build a config, clamping every field.
    pub fn new(threshold: usize, keep_ratio: f64, chunk_size: usize, extract_interval: usize) -> Self {
        let keep_ratio = if keep_ratio.is_finite() { keep_ratio } else { 0.25 };
        Self {
            threshold: threshold.max(1),
            keep_ratio: keep_ratio.clamp(0.05, 0.9),
            chunk_size: chunk_size.max(1),
            extract_interval: extract_interval.max(1),
        }
    }

    /// Messages retained when compacting `count` messages: `max(1, ceil(count × ratio))`.
    pub fn keep_count(&self, count: usize) -> usize {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let keep = (count as f64 * self.keep_ratio).ceil() as usize;
        keep.max(1)
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self::new(40, 0.25, 10, 10)
    }
}

/// Summarizes long sessions and feeds the procedure learner.
pub struct CompactionEngine {
    sessions: Arc<SessionStore>,
    procedures: Arc<ProcedureStore>,
    candidates: Arc<CandidateStore>,
    summarizer: Arc<dyn ChunkSummarizer>,
    config: CompactionConfig,
}

impl CompactionEngine {
    /// Wire an engine over shared stores.
    pub fn new(
        sessions: Arc<SessionStore>,
        procedures: Arc<ProcedureStore>,
        candidates: Arc<CandidateStore>,
        summarizer: Arc<dyn ChunkSummarizer>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            sessions,
            procedures,
            candidates,
            summarizer,
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Compact `session_id` if it has reached the threshold.
    ///
    /// `cached_count` skips the count lookup when the caller just appended.
    /// The caller is expected to hold the session guard. Returns whether a
    /// compaction was committed.
    pub async fn maybe_compact(
        &self,
        session_id: &str,
        cached_count: Option<usize>,
        on_flush: Option<&FlushFn<'_>>,
    ) -> Result<bool> {
        let precheck = match cached_count {
            Some(n) => n,
            None => self.sessions.message_count(session_id)?,
        };
        if precheck < self.config.threshold {
            return Ok(false);
        }

        let messages = self.sessions.read_messages(session_id, None)?;
        let count = messages.len();
        if count < self.config.threshold {
            return Ok(false);
        }
        let keep = self.config.keep_count(count);
        let compact_count = count.saturating_sub(keep);
        if compact_count == 0 {
            return Ok(false);
        }

        let (compacted, kept) = messages.split_at(compact_count);
        let summary = self.summarize(compacted).await;
        let record = CompactionRecord {
            timestamp: Utc::now(),
            summary,
            compacted_messages: compacted.len(),
            kept_messages: kept.len(),
            kept_from: format!("m{}", compact_count + 1),
        };

        let mut entries = Vec::with_capacity(kept.len() + 1);
        entries.push(SessionEntry::Compaction(record));
        entries.extend(kept.iter().cloned().map(SessionEntry::Message));
        self.sessions.rewrite(session_id, &entries)?;
        info!(session_id, compacted = compacted.len(), kept = kept.len(), "session compacted");

        if let Some(flush) = on_flush {
            if let Err(e) = flush(compacted) {
                warn!(session_id, error = %e, "compaction flush failed; compaction persisted");
            }
        }

        if let Err(e) = self.learn_from(compacted) {
            warn!(session_id, error = %e, "candidate ingestion after compaction failed");
        }
        Ok(true)
    }

    /// Mine candidates from the last `extract_interval` messages whenever
    /// `count` is a positive multiple of the interval.
    pub fn maybe_extract_candidates(&self, session_id: &str, count: usize) -> Result<Vec<Procedure>> {
        let interval = self.config.extract_interval;
        if count == 0 || count % interval != 0 {
            return Ok(Vec::new());
        }
        let recent = self.sessions.read_messages(session_id, Some(interval))?;
        if recent.is_empty() {
            return Ok(Vec::new());
        }
        let promoted = self.learn_from(&recent)?;
        debug!(session_id, count, promoted = promoted.len(), "periodic candidate extraction");
        Ok(promoted)
    }

    fn learn_from(&self, messages: &[MessageEntry]) -> Result<Vec<Procedure>> {
        let candidates = extract_candidates(messages);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let promoted = self.candidates.ingest(&candidates)?;
        if !promoted.is_empty() {
            let _ = self.procedures.upsert(&promoted)?;
        }
        Ok(promoted)
    }

    async fn summarize(&self, messages: &[MessageEntry]) -> String {
        let mut lines: Vec<String> = Vec::new();
        for (index, chunk) in messages.chunks(self.config.chunk_size).enumerate() {
            let summary = match self.summarizer.summarize(chunk).await {
                Ok(raw) => {
                    let normalized = normalize_summary(&raw);
                    if normalized.is_empty() {
                        fallback_chunk_summary(chunk)
                    } else {
                        normalized
                    }
                }
                Err(e) => {
                    warn!(chunk = index + 1, error = %e, "chunk summarization failed; using fallback");
                    fallback_chunk_summary(chunk)
                }
            };
            lines.push(format!("Chunk {}:", index + 1));
            lines.extend(summary.lines().map(str::to_string));
        }
        let joined = lines.join("\n");
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            EMPTY_SUMMARY.to_string()
        } else {
            trimmed.to_string()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
