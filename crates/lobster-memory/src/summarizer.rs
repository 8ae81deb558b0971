//! Chunk summarization for compaction.
//!
//! [`ChunkSummarizer`] is the seam the compaction engine calls once per
//! chunk. [`CliSummarizer`] shells out to the LLM command line; tests inject
//! their own implementations.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lobster_core::text::{collapse_whitespace, truncate_chars, truncate_with_ellipsis};
use regex::Regex;
use tracing::{debug, warn};

use crate::errors::{MemoryError, Result};
use crate::sessions::MessageEntry;

/// Lower bound on the summarizer process timeout.
pub const MIN_SUMMARY_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-message cap inside a chunk prompt.
pub const PROMPT_LINE_MAX_CHARS: usize = 320;
/// Bullets kept from a summary.
pub const MAX_SUMMARY_BULLETS: usize = 3;
/// Length cap for the single-line fallback bullet.
pub const FALLBACK_LINE_MAX_CHARS: usize = 220;

static NUMBERED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.)]\s*(.+)$").expect("numbered line pattern compiles"));

/// Turns a chunk of messages into a short bullet summary.
#[async_trait]
pub trait ChunkSummarizer: Send + Sync {
    /// Summarize one chunk. Errors and empty output trigger the metadata fallback.
    async fn summarize(&self, chunk: &[MessageEntry]) -> Result<String>;
}

/// Summarizer backed by the LLM command line (`<command> <args…> -p <prompt>`).
pub struct CliSummarizer {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CliSummarizer {
    /// Build a summarizer. The timeout is raised to [`MIN_SUMMARY_TIMEOUT`].
    pub fn new(command: impl Into<String>, args: Vec<String>, cwd: Option<PathBuf>, timeout: Duration) -> Self {
        let command = command.into();
        let command = if command.trim().is_empty() {
            "gemini".to_string()
        } else {
            command.trim().to_string()
        };
        Self {
            command,
            args,
            cwd,
            timeout: timeout.max(MIN_SUMMARY_TIMEOUT),
        }
    }

    /// Effective process timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ChunkSummarizer for CliSummarizer {
    async fn summarize(&self, chunk: &[MessageEntry]) -> Result<String> {
        let start = Instant::now();
        let prompt = build_chunk_prompt(chunk);

        let mut cmd = tokio::process::Command::new(&self.command);
        let _ = cmd
            .args(&self.args)
            .arg("-p")
            .arg(&prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            let _ = cmd.current_dir(cwd);
        }

        let child = cmd
            .spawn()
            .map_err(|e| MemoryError::Summarizer(format!("failed to spawn {}: {e}", self.command)))?;

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|e| MemoryError::Summarizer(format!("summarizer wait failed: {e}")))?
            }
            () = tokio::time::sleep(self.timeout) => {
                warn!(command = %self.command, timeout_s = self.timeout.as_secs_f64(), "summarizer timed out");
                return Err(MemoryError::Summarizer(format!(
                    "timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MemoryError::Summarizer(format!(
                "{} exited with code {}: {stderr}",
                self.command,
                output.status.code().unwrap_or(-1)
            )));
        }

        debug!(
            messages = chunk.len(),
            duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "chunk summarized"
        );
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Prompt asking the model for a 2–3 bullet summary of `chunk`.
pub fn build_chunk_prompt(chunk: &[MessageEntry]) -> String {
    let mut lines = vec![
        "Summarize this transcript chunk for long-term memory compaction.".to_string(),
        "Return 2-3 short bullet points only.".to_string(),
        "Prioritize decisions, facts, preferences, and completed actions.".to_string(),
        "Do not include markdown headers or code fences.".to_string(),
        String::new(),
        "Transcript:".to_string(),
    ];
    for entry in chunk {
        let content = entry.content();
        if content.is_empty() {
            continue;
        }
        let mut role = entry.role();
        if role.is_empty() {
            role = "unknown".to_string();
        }
        let compact = truncate_with_ellipsis(&collapse_whitespace(content), PROMPT_LINE_MAX_CHARS);
        lines.push(format!("{role}: {compact}"));
    }
    lines.join("\n").trim().to_string()
}

/// Reduce raw model output to at most three `- ` bullets.
///
/// Code fences are dropped, `*` and numbered lines become bullets. Returns an
/// empty string when nothing usable remains.
pub fn normalize_summary(raw: &str) -> String {
    let cleaned = raw
        .replace('\r', "")
        .replace("```markdown", "")
        .replace("```text", "")
        .replace("```", "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return String::new();
    }

    let mut bullets: Vec<String> = Vec::new();
    for raw_line in cleaned.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('-').or_else(|| line.strip_prefix('*')) {
            line = rest.trim();
        } else if let Some(caps) = NUMBERED_LINE.captures(line) {
            line = caps.get(1).map_or(line, |m| m.as_str().trim());
        }
        if line.is_empty() {
            continue;
        }
        bullets.push(format!("- {line}"));
        if bullets.len() >= MAX_SUMMARY_BULLETS {
            break;
        }
    }

    if bullets.is_empty() {
        let one_line = collapse_whitespace(cleaned);
        if !one_line.is_empty() {
            bullets.push(format!("- {}", truncate_chars(&one_line, FALLBACK_LINE_MAX_CHARS)));
        }
    }
    bullets.join("\n")
}

/// Metadata-only summary used when the summarizer is unavailable.
pub fn fallback_chunk_summary(chunk: &[MessageEntry]) -> String {
    let users = chunk.iter().filter(|m| m.role() == "user").count();
    let assistants = chunk.iter().filter(|m| m.role() == "assistant").count();
    format!(
        "- Summarized {} messages ({users} user, {assistants} assistant).\n\
         - Summarizer unavailable; compacted using metadata-only fallback.",
        chunk.len()
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn msg(role: &str, content: &str) -> MessageEntry {
        MessageEntry::new(role, content, None)
    }

    #[test]
    fn prompt_lists_compacted_lines() {
        let long = "word ".repeat(100);
        let prompt = build_chunk_prompt(&[
            msg("User", "  hello\n\n there "),
            msg("assistant", ""),
            msg("assistant", &long),
        ]);
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(lines[0], "Summarize this transcript chunk for long-term memory compaction.");
        assert_eq!(lines[5], "Transcript:");
        assert_eq!(lines[6], "user: hello there");
        assert_eq!(lines.len(), 8);
        let last = lines[7].strip_prefix("assistant: ").unwrap();
        assert_eq!(last.chars().count(), PROMPT_LINE_MAX_CHARS);
        assert!(last.ends_with("..."));
    }

    #[test]
    fn normalize_converts_markers_and_caps_bullets() {
        let raw = "```markdown\n* first\n2) second\n- third\n- fourth\n```";
        assert_eq!(normalize_summary(raw), "- first\n- second\n- third");
    }

    #[test]
    fn normalize_plain_lines_become_bullets() {
        assert_eq!(normalize_summary("User prefers tabs."), "- User prefers tabs.");
        assert_eq!(normalize_summary("  \n```\n```"), "");
    }

    #[test]
    fn fallback_counts_roles() {
        let chunk = [msg("user", "a"), msg("assistant", "b"), msg("user", "c"), msg("system", "d")];
        assert_eq!(
            fallback_chunk_summary(&chunk),
            "- Summarized 4 messages (2 user, 1 assistant).\n\
             - Summarizer unavailable; compacted using metadata-only fallback."
        );
    }

    #[test]
    fn timeout_has_floor() {
        let s = CliSummarizer::new("gemini", vec![], None, Duration::from_secs(1));
        assert_eq!(s.timeout(), MIN_SUMMARY_TIMEOUT);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_summarizer_reads_stdout() {
        let s = CliSummarizer::new(
            "sh",
            vec!["-c".into(), "printf '1. did x\\n2. did y\\n'".into(), "sh".into()],
            None,
            Duration::from_secs(10),
        );
        let out = s.summarize(&[msg("user", "hi")]).await.unwrap();
        assert_eq!(normalize_summary(&out), "- did x\n- did y");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_summarizer_reports_nonzero_exit() {
        let s = CliSummarizer::new(
            "sh",
            vec!["-c".into(), "echo boom >&2; exit 3".into(), "sh".into()],
            None,
            Duration::from_secs(10),
        );
        let err = s.summarize(&[msg("user", "hi")]).await.unwrap_err();
        assert_matches!(err, MemoryError::Summarizer(ref m) if m.contains("code 3") && m.contains("boom"));
    }
}
