//! Capability scope ("MCP server") catalog and resolution.
//!
//! The catalog is every `*.json` file in the MCP config directory. A file is
//! either one server (`{"name": …, "command": …}`) or a map under
//! `mcpServers`. `${VAR}` references in string values are substituted from
//! the environment; unset variables become empty.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, RuntimeError};

/// The "all servers" scope marker.
pub const WILDCARD: &str = "*";

static ENV_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env reference pattern compiles"));

/// One configured MCP server.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServer {
    /// Catalog name.
    #[serde(default)]
    pub name: String,
    /// Launch command.
    #[serde(default)]
    pub command: String,
    /// Launch arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Whether `scope` is the wildcard `["*"]`.
pub fn is_wildcard(scope: &[String]) -> bool {
    scope.iter().any(|s| s == WILDCARD)
}

/// Replace `${VAR}` references in every string of `value`.
pub fn substitute_env(value: Value, lookup: &dyn Fn(&str) -> Option<String>) -> Value {
    match value {
        Value::String(s) => Value::String(
            ENV_REFERENCE
                .replace_all(&s, |caps: &Captures<'_>| lookup(&caps[1]).unwrap_or_default())
                .into_owned(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| substitute_env(v, lookup)).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, substitute_env(v, lookup))).collect()),
        other => other,
    }
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Validates requested capability scopes against the catalog.
#[derive(Clone, Debug, Default)]
pub struct CapabilityResolver {
    catalog: BTreeMap<String, McpServer>,
}

impl CapabilityResolver {
    /// Resolver over an explicit set of servers.
    pub fn from_servers(servers: impl IntoIterator<Item = McpServer>) -> Self {
        let catalog = servers
            .into_iter()
            .filter(|s| !s.name.trim().is_empty())
            .map(|s| (s.name.trim().to_string(), s))
            .collect();
        Self { catalog }
    }

    /// Load every `*.json` file under `dir`, substituting from the process environment.
    /// A missing directory yields an empty catalog.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_with(dir, &process_env)
    }

    /// [`load`](Self::load) with an explicit variable lookup.
    pub fn load_with(dir: &Path, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        if !dir.is_dir() {
            return Ok(Self::default());
        }
        let mut files: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut servers = Vec::new();
        for path in files {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable MCP config");
                    continue;
                }
            };
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => servers.extend(servers_from_document(substitute_env(value, lookup))),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed MCP config"),
            }
        }
        let resolver = Self::from_servers(servers);
        debug!(dir = %dir.display(), servers = resolver.catalog.len(), "MCP catalog loaded");
        Ok(resolver)
    }

    /// Sorted catalog names.
    pub fn available(&self) -> Vec<String> {
        self.catalog.keys().cloned().collect()
    }

    /// Catalog entry by name.
    pub fn get(&self, name: &str) -> Option<&McpServer> {
        self.catalog.get(name)
    }

    /// Resolve a requested scope.
    ///
    /// Empty or wildcard requests resolve to `["*"]`. Otherwise every name
    /// must be in the catalog; duplicates are dropped, first occurrence wins.
    pub fn resolve(&self, requested: &[String]) -> Result<Vec<String>> {
        let names: Vec<&str> = requested.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
        if names.is_empty() || names.contains(&WILDCARD) {
            return Ok(vec![WILDCARD.to_string()]);
        }

        let mut unknown: Vec<String> = names
            .iter()
            .filter(|n| !self.catalog.contains_key(**n))
            .map(|n| (*n).to_string())
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            unknown.dedup();
            return Err(RuntimeError::UnknownCapabilities(unknown));
        }

        let mut seen = HashSet::new();
        Ok(names
            .into_iter()
            .filter(|n| seen.insert(*n))
            .map(str::to_string)
            .collect())
    }
}

fn servers_from_document(doc: Value) -> Vec<McpServer> {
    let enabled = |v: &Value| v.get("enabled").and_then(Value::as_bool).unwrap_or(true);

    if let Some(Value::Object(map)) = doc.get("mcpServers") {
        return map
            .iter()
            .filter(|(_, v)| enabled(v))
            .filter_map(|(name, v)| {
                let mut server: McpServer = serde_json::from_value(v.clone()).ok()?;
                server.name.clone_from(name);
                Some(server)
            })
            .collect();
    }
    if !enabled(&doc) {
        return Vec::new();
    }
    serde_json::from_value::<McpServer>(doc)
        .ok()
        .filter(|s| !s.name.trim().is_empty())
        .into_iter()
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
