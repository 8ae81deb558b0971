//! Prompt context assembly.
//!
//! Output shape is fixed; sections with nothing to say carry a placeholder:
//!
//! ```text
//! # Agent Persona
//! # User Preferences
//! # Agent Memory
//! # Known Procedures
//! # Compaction Summary
//! # Recent Conversation
//! # New User Prompt
//! ```

use std::sync::Arc;

use lobster_core::text::truncate_chars;

use crate::errors::Result;
use crate::global::GlobalMemoryManager;
use crate::manager::MemoryManager;
use crate::procedures::Procedure;

/// Placeholder for absent list-like sections.
pub const NONE_PLACEHOLDER: &str = "(none)";
/// Placeholder for empty documents.
pub const EMPTY_PLACEHOLDER: &str = "(empty)";
/// Description used when a persona has no soul text.
pub const NO_DESCRIPTION: &str = "No description provided.";
/// Length cap of [`summarize_soul`].
pub const SOUL_SUMMARY_MAX_CHARS: usize = 140;

/// Another agent this one may delegate to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerAgent {
    /// Agent id.
    pub id: String,
    /// One-line description.
    pub description: String,
}

/// Supplies the current delegation roster.
pub type PeerProvider = Arc<dyn Fn() -> Vec<PeerAgent> + Send + Sync>;

/// Builds the prompt sent to the backend for one turn.
pub struct ContextBuilder {
    memory: Arc<MemoryManager>,
    global: Option<Arc<GlobalMemoryManager>>,
    message_limit: usize,
    procedure_limit: usize,
    preamble: String,
    agent_id: Option<String>,
    peers: Option<PeerProvider>,
}

impl ContextBuilder {
    /// Builder over an agent's memory with default limits (12 messages, 3 procedures).
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self {
            memory,
            global: None,
            message_limit: 12,
            procedure_limit: 3,
            preamble: String::new(),
            agent_id: None,
            peers: None,
        }
    }

    /// Include user preferences and shared procedures.
    #[must_use]
    pub fn with_global(mut self, global: Arc<GlobalMemoryManager>) -> Self {
        self.global = Some(global);
        self
    }

    /// Persona text placed at the top.
    #[must_use]
    pub fn with_preamble(mut self, preamble: &str) -> Self {
        self.preamble = preamble.trim().to_string();
        self
    }

    /// Recent-message and matched-procedure caps.
    #[must_use]
    pub fn with_limits(mut self, messages: usize, procedures: usize) -> Self {
        self.message_limit = messages;
        self.procedure_limit = procedures.max(1);
        self
    }

    /// Delegation roster; `agent_id` is excluded from it.
    #[must_use]
    pub fn with_peers(mut self, agent_id: &str, peers: PeerProvider) -> Self {
        let id = agent_id.trim();
        self.agent_id = (!id.is_empty()).then(|| id.to_string());
        self.peers = Some(peers);
        self
    }

    /// The agent memory this builder reads.
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Assemble the context for `prompt` in `session_id`.
    pub fn build(&self, session_id: &str, prompt: &str) -> Result<String> {
        let memory_text = self.memory.read_memory()?;
        let recent = self.memory.read_messages(session_id, Some(self.message_limit))?;
        let compaction = self.memory.read_latest_compaction(session_id)?;

        let (user_memory, global_procedures) = match &self.global {
            Some(global) => (global.read_user_memory()?, global.list_procedures()?),
            None => (String::new(), Vec::new()),
        };
        let matched = self
            .memory
            .match_procedures(prompt, &global_procedures, self.procedure_limit)?;

        let history: Vec<String> = recent
            .iter()
            .filter(|m| !m.message.role.trim().is_empty() && !m.content().is_empty())
            .map(|m| format!("{}: {}", m.message.role.trim(), m.content()))
            .collect();

        let persona = match self.roster() {
            Some(roster) => format!("{}\n\n{roster}", self.preamble).trim().to_string(),
            None => self.preamble.clone(),
        };

        let summary = compaction.map(|c| c.summary.trim().to_string()).unwrap_or_default();
        let procedures_text = format_procedures(&matched);
        let history_text = history.join("\n");
        let parts: [&str; 20] = [
            "# Agent Persona",
            or_placeholder(&persona, NONE_PLACEHOLDER),
            "",
            "# User Preferences",
            or_placeholder(user_memory.trim(), EMPTY_PLACEHOLDER),
            "",
            "# Agent Memory",
            or_placeholder(memory_text.trim(), EMPTY_PLACEHOLDER),
            "",
            "# Known Procedures",
            procedures_text.as_str(),
            "",
            "# Compaction Summary",
            or_placeholder(&summary, NONE_PLACEHOLDER),
            "",
            "# Recent Conversation",
            or_placeholder(&history_text, NONE_PLACEHOLDER),
            "",
            "# New User Prompt",
            prompt.trim(),
        ];
        Ok(format!("{}\n", parts.join("\n").trim()))
    }

    fn roster(&self) -> Option<String> {
        let provider = self.peers.as_ref()?;
        let mut peers: Vec<PeerAgent> = provider()
            .into_iter()
            .filter(|p| !p.id.trim().is_empty())
            .filter(|p| self.agent_id.as_deref() != Some(p.id.trim()))
            .map(|p| PeerAgent {
                id: p.id.trim().to_string(),
                description: or_placeholder(p.description.trim(), NO_DESCRIPTION).to_string(),
            })
            .collect();
        peers.sort();

        let mut lines = vec![
            "## Available Agents for Delegation".to_string(),
            "You can delegate tasks to other agents using the delegate_to_agent tool.".to_string(),
        ];
        if peers.is_empty() {
            lines.push(format!("Available agents: {NONE_PLACEHOLDER}"));
        } else {
            lines.push("Available agents:".to_string());
            lines.extend(peers.iter().map(|p| format!("- {}: {}", p.id, p.description)));
        }
        Some(lines.join("\n"))
    }
}

fn or_placeholder<'a>(text: &'a str, placeholder: &'a str) -> &'a str {
    if text.is_empty() { placeholder } else { text }
}

fn format_procedures(procedures: &[Procedure]) -> String {
    if procedures.is_empty() {
        return NONE_PLACEHOLDER.to_string();
    }
    let mut lines = Vec::new();
    for p in procedures {
        lines.push(format!("## {}", p.title));
        lines.push(format!("Trigger: {}", p.trigger));
        lines.push("Steps:".to_string());
        lines.extend(p.steps.iter().enumerate().map(|(i, s)| format!("{}. {s}", i + 1)));
        lines.push(String::new());
    }
    lines.join("\n").trim_end().to_string()
}

/// One-line description from soul text: the first non-empty line with
/// leading `#` removed, capped at 140 chars.
pub fn summarize_soul(soul: &str) -> String {
    soul.lines()
        .map(|line| line.trim().trim_start_matches('#').trim())
        .find(|line| !line.is_empty())
        .map_or_else(
            || NO_DESCRIPTION.to_string(),
            |line| truncate_chars(line, SOUL_SUMMARY_MAX_CHARS).to_string(),
        )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
