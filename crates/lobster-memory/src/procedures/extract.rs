//! Candidate extraction from user → assistant exchanges.

use std::collections::HashSet;
use std::sync::LazyLock;

use lobster_core::text::{collapse_whitespace, normalize};
use regex::Regex;

use super::codec::parse_step_line;
use super::{Procedure, tokenize};
use crate::sessions::MessageEntry;

/// Minimum steps for an exchange to count as a procedure.
pub const MIN_STEPS: usize = 3;
/// Steps kept per candidate.
pub const MAX_STEPS: usize = 8;
/// Non-stop-word tokens forming a trigger.
pub const TRIGGER_TOKENS: usize = 5;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "i", "in", "is", "it", "my", "of",
    "on", "or", "please", "the", "this", "to", "we", "with", "you",
];

const ACTION_VERBS: &[&str] = &[
    "add", "apply", "build", "check", "configure", "create", "deploy", "install", "open", "push", "reload",
    "restart", "review", "run", "save", "test", "update", "verify", "write",
];

static SENTENCE_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\n.;]+").expect("sentence split pattern compiles"));

/// Trigger phrase for a user prompt.
pub fn trigger_from_prompt(prompt: &str) -> String {
    let tokens = tokenize(prompt);
    let meaningful: Vec<&str> = tokens
        .iter()
        .map(String::as_str)
        .filter(|t| !STOPWORDS.contains(t))
        .take(TRIGGER_TOKENS)
        .collect();
    if meaningful.is_empty() {
        tokens.iter().take(TRIGGER_TOKENS).cloned().collect::<Vec<_>>().join(" ")
    } else {
        meaningful.join(" ")
    }
}

/// Ordered steps found in an assistant reply.
pub fn steps_from_reply(reply: &str) -> Vec<String> {
    let listed: Vec<String> = reply
        .lines()
        .filter_map(parse_step_line)
        .map(collapse_whitespace)
        .filter(|s| !s.is_empty())
        .collect();
    if listed.len() >= MIN_STEPS {
        return listed.into_iter().take(MAX_STEPS).collect();
    }

    let mut seen = HashSet::new();
    let mut steps = Vec::new();
    for raw in SENTENCE_SPLIT.split(reply) {
        let sentence = collapse_whitespace(raw.trim_matches(|c: char| " -*\t\r".contains(c)));
        let tokens = tokenize(&sentence);
        let starts_with_verb = tokens.first().is_some_and(|t| ACTION_VERBS.contains(&t.as_str()));
        if tokens.len() < 2 || !starts_with_verb {
            continue;
        }
        if seen.insert(normalize(&sentence)) {
            steps.push(sentence);
        }
        if steps.len() >= MAX_STEPS {
            break;
        }
    }
    steps
}

/// Mine candidates from a message window.
///
/// Each user message is paired with the next assistant message; exchanges
/// yielding fewer than [`MIN_STEPS`] steps or no trigger are skipped.
pub fn extract_candidates(messages: &[MessageEntry]) -> Vec<Procedure> {
    let mut found = Vec::new();
    let mut pending_prompt: Option<&str> = None;
    for entry in messages {
        match entry.role().as_str() {
            "user" => pending_prompt = Some(entry.content()),
            "assistant" => {
                let Some(prompt) = pending_prompt.take() else {
                    continue;
                };
                let trigger = trigger_from_prompt(prompt);
                let steps = steps_from_reply(entry.content());
                if trigger.is_empty() || steps.len() < MIN_STEPS {
                    continue;
                }
                found.push(Procedure::candidate(&trigger, steps));
            }
            _ => {}
        }
    }
    found
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> MessageEntry {
        MessageEntry::new(role, content, None)
    }

    #[test]
    fn trigger_drops_stopwords() {
        assert_eq!(trigger_from_prompt("Please deploy the app to production"), "deploy app production");
        assert_eq!(trigger_from_prompt("how to"), "how to");
        assert_eq!(
            trigger_from_prompt("rotate keys rebuild cache flush queue restart"),
            "rotate keys rebuild cache flush"
        );
    }

    #[test]
    fn numbered_steps_are_preferred() {
        let reply = "Sure:\n1. Check git status\n2. Run the tests\n3. Push the image\n";
        assert_eq!(
            steps_from_reply(reply),
            vec!["Check git status", "Run the tests", "Push the image"]
        );
    }

    #[test]
    fn numbered_steps_are_capped() {
        let reply: String = (1..=12).map(|i| format!("{i}. step {i}\n")).collect();
        assert_eq!(steps_from_reply(&reply).len(), MAX_STEPS);
    }

    #[test]
    fn sentence_fallback_needs_action_verbs() {
        let reply = "Run the linter. Build it; deploy to staging. It went fine. Run   the linter.\nOk";
        assert_eq!(steps_from_reply(reply), vec!["Run the linter", "Build it", "deploy to staging"]);
    }

    #[test]
    fn extracts_paired_exchange() {
        let messages = vec![
            msg("assistant", "orphan reply"),
            msg("user", "Please deploy the app to production"),
            msg("assistant", "1. Check git status\n2. Run tests\n3. Push image"),
            msg("user", "thanks"),
            msg("assistant", "You're welcome."),
        ];
        let found = extract_candidates(&messages);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].trigger, "deploy app production");
        assert_eq!(found[0].title, "Deploy App Production");
        assert_eq!(found[0].steps.len(), 3);
    }

    #[test]
    fn unpaired_user_messages_use_latest_prompt() {
        let messages = vec![
            msg("user", "ignored prompt"),
            msg("user", "restart the web server"),
            msg("assistant", "- check logs\n- restart nginx\n- verify health"),
        ];
        let found = extract_candidates(&messages);
        assert_eq!(found[0].trigger, "restart web server");
    }
}
