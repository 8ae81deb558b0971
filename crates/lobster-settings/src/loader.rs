//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LobsterSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `LOBSTER_*` environment variable overrides (highest priority)
//! 4. Resolve relative directories against the settings file's directory
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::LobsterSettings;

/// Load settings from `path` with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LobsterSettings> {
    let defaults = serde_json::to_value(LobsterSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LobsterSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);

    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    resolve_relative_dirs(&mut settings, &base);

    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Make every relative directory setting relative to `base` instead of the
/// process working directory.
pub fn resolve_relative_dirs(settings: &mut LobsterSettings, base: &Path) {
    for dir in [
        &mut settings.agents.data_dir,
        &mut settings.backend.workspace_dir,
        &mut settings.mcp.config_dir,
    ] {
        if dir.is_relative() {
            *dir = base.join(&*dir);
        }
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Variables follow `LOBSTER_<SECTION>_<KEY>`. Invalid values are ignored
/// with a warning and the file/default value is kept.
pub fn apply_env_overrides(settings: &mut LobsterSettings) {
    // ── Agents ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("LOBSTER_AGENTS_DATA_DIR") {
        settings.agents.data_dir = PathBuf::from(v);
    }
    if let Some(v) = read_env_usize("LOBSTER_AGENTS_COMPACT_THRESHOLD", 1, 100_000) {
        settings.agents.compact_threshold = v;
    }
    if let Some(v) = read_env_f64("LOBSTER_AGENTS_COMPACT_KEEP_RATIO", 0.0, 1.0) {
        settings.agents.compact_keep_ratio = v;
    }
    if let Some(v) = read_env_usize("LOBSTER_AGENTS_COMPACT_CHUNK_SIZE", 1, 10_000) {
        settings.agents.compact_chunk_size = v;
    }
    if let Some(v) = read_env_usize("LOBSTER_AGENTS_MEMORY_MAX_SECTIONS", 1, 100_000) {
        settings.agents.memory_max_sections = v;
    }
    if let Some(v) = read_env_usize("LOBSTER_AGENTS_CONTEXT_MESSAGES", 0, 10_000) {
        settings.agents.context_messages = v;
    }
    if let Some(v) = read_env_u64("LOBSTER_AGENTS_HEALTH_CHECK_INTERVAL_S", 1, 86_400) {
        settings.agents.health_check_interval_s = v;
    }
    if let Some(v) = read_env_u64("LOBSTER_AGENTS_STUCK_TIMEOUT_S", 1, 86_400) {
        settings.agents.stuck_timeout_s = v;
    }

    // ── Backend ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("LOBSTER_BACKEND_COMMAND") {
        settings.backend.command = v;
    }
    if let Some(v) = read_env_string("LOBSTER_BACKEND_ARGS") {
        settings.backend.args = split_args(&v);
    }
    if let Some(v) = read_env_string("LOBSTER_BACKEND_WORKSPACE_DIR") {
        settings.backend.workspace_dir = PathBuf::from(v);
    }
    if let Some(v) = read_env_f64("LOBSTER_BACKEND_RESPONSE_TIMEOUT_S", 1.0, 86_400.0) {
        settings.backend.response_timeout_s = v;
    }

    // ── MCP / logging ───────────────────────────────────────────────
    if let Some(v) = read_env_string("LOBSTER_MCP_CONFIG_DIR") {
        settings.mcp.config_dir = PathBuf::from(v);
    }
    if let Some(v) = read_env_bool("LOBSTER_EVENTS_PERSIST") {
        settings.events.persist = v;
    }
    if let Some(v) = read_env_string("LOBSTER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("LOBSTER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a finite `f64` within a range.
pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.trim().parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

/// Split a whitespace-separated argument list.
pub fn split_args(val: &str) -> Vec<String> {
    val.split_whitespace().map(str::to_string).collect()
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

fn read_env_f64(name: &str, min: f64, max: f64) -> Option<f64> {
    let val = std::env::var(name).ok()?;
    let result = parse_f64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid float env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
