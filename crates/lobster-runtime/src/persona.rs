//! Agent personas and their on-disk store.
//!
//! ```text
//! <data_dir>/agents/<id>/agent.json   persona metadata (no soul)
//! <data_dir>/agents/<id>/SOUL.md      persona prompt fragment
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use lobster_core::fs::atomic_write;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capabilities::WILDCARD;
use crate::errors::{Result, RuntimeError};

/// Emoji used when none is set.
pub const DEFAULT_EMOJI: &str = "🤖";
/// Model used when none is set.
pub const DEFAULT_PERSONA_MODEL: &str = "gemini";
/// Highest numeric suffix tried by [`PersonaStore::ensure_unique_id`].
pub const MAX_ID_SUFFIX: u32 = 999;

const INVALID_ID_MESSAGE: &str = "Agent id must be a slug using lowercase letters, numbers, and dashes";

static AGENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("agent id pattern compiles"));
static NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern compiles"));

/// Whether `id` is a valid agent slug.
pub fn is_valid_agent_id(id: &str) -> bool {
    AGENT_ID.is_match(id.trim())
}

/// Turn arbitrary text into an agent slug (`agent` when nothing survives).
pub fn slugify(value: &str) -> String {
    let lowered = value.to_lowercase();
    let slug = NON_SLUG.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() { "agent".to_string() } else { slug.to_string() }
}

fn default_emoji() -> String {
    DEFAULT_EMOJI.to_string()
}

fn default_model() -> String {
    DEFAULT_PERSONA_MODEL.to_string()
}

fn default_servers() -> Vec<String> {
    vec![WILDCARD.to_string()]
}

fn default_true() -> bool {
    true
}

/// Durable identity of one agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    /// Immutable slug. The directory name wins on load.
    #[serde(default)]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Display emoji.
    #[serde(default = "default_emoji")]
    pub emoji: String,
    /// Persona prompt, stored in `SOUL.md`.
    #[serde(skip)]
    pub soul: String,
    /// Model name passed to the backend.
    #[serde(default = "default_model")]
    pub model: String,
    /// Allowed capability scope.
    #[serde(default = "default_servers")]
    pub mcp_servers: Vec<String>,
    /// External chat bot identity.
    #[serde(default)]
    pub bot_user_id: Option<String>,
    /// Whether `start_all` starts this agent.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last save time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Persona {
    /// A new enabled persona with defaults.
    pub fn new(id: &str, name: &str) -> Result<Self> {
        let now = Utc::now();
        let mut persona = Self {
            id: id.to_string(),
            name: name.to_string(),
            emoji: default_emoji(),
            soul: String::new(),
            model: default_model(),
            mcp_servers: default_servers(),
            bot_user_id: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        };
        persona.normalize()?;
        Ok(persona)
    }

    /// Set the soul text.
    #[must_use]
    pub fn with_soul(mut self, soul: &str) -> Self {
        self.soul = soul.trim().to_string();
        self
    }

    /// Validate the id and fill blank fields with defaults.
    pub fn normalize(&mut self) -> Result<()> {
        if !is_valid_agent_id(&self.id) {
            return Err(RuntimeError::Validation(INVALID_ID_MESSAGE.to_string()));
        }
        self.id = self.id.trim().to_string();
        self.name = match self.name.trim() {
            "" => self.id.clone(),
            name => name.to_string(),
        };
        self.emoji = match self.emoji.trim() {
            "" => default_emoji(),
            emoji => emoji.to_string(),
        };
        self.soul = self.soul.trim().to_string();
        self.model = match self.model.trim() {
            "" => default_model(),
            model => model.to_string(),
        };
        self.mcp_servers = self
            .mcp_servers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if self.mcp_servers.is_empty() {
            self.mcp_servers = default_servers();
        }
        self.bot_user_id = self
            .bot_user_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(())
    }
}

/// File-backed persona store rooted at `<data_dir>/agents`.
pub struct PersonaStore {
    root: PathBuf,
}

impl PersonaStore {
    /// Open the store, creating `<data_dir>/agents`.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let root = data_dir.as_ref().join("agents");
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The `agents` directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Private directory of agent `id`.
    pub fn agent_dir(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_agent_id(id) {
            return Err(RuntimeError::Validation(format!("Invalid agent id: {id}")));
        }
        Ok(self.root.join(id.trim()))
    }

    /// `preferred` (slugified if needed), suffixed `-2`, `-3`, … until unused.
    pub fn ensure_unique_id(&self, preferred: &str) -> Result<String> {
        let base = if is_valid_agent_id(preferred) {
            preferred.trim().to_string()
        } else {
            slugify(preferred)
        };
        if !self.root.join(&base).exists() {
            return Ok(base);
        }
        (2..=MAX_ID_SUFFIX)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.root.join(candidate).exists())
            .ok_or_else(|| RuntimeError::Validation(format!("Could not generate unique agent id for '{preferred}'")))
    }

    /// Create and save a persona named `name` under a fresh unique id.
    pub fn create(&self, name: &str, soul: &str) -> Result<Persona> {
        let id = self.ensure_unique_id(name)?;
        let persona = Persona::new(&id, name)?.with_soul(soul);
        self.save(&persona)
    }

    /// Load persona `id`; `None` when it has no `agent.json`.
    pub fn load(&self, id: &str) -> Result<Option<Persona>> {
        let dir = self.agent_dir(id)?;
        let meta = dir.join("agent.json");
        if !meta.is_file() {
            return Ok(None);
        }
        let mut persona: Persona = serde_json::from_str(&std::fs::read_to_string(&meta)?)?;
        persona.id = id.trim().to_string();
        let soul = dir.join("SOUL.md");
        if soul.is_file() {
            persona.soul = std::fs::read_to_string(soul)?;
        }
        persona.normalize()?;
        Ok(Some(persona))
    }

    /// Persist `persona`, keeping the stored `created_at` when one exists.
    pub fn save(&self, persona: &Persona) -> Result<Persona> {
        let mut saved = persona.clone();
        saved.normalize()?;
        let dir = self.agent_dir(&saved.id)?;
        std::fs::create_dir_all(dir.join("sessions"))?;

        if let Some(existing) = self.load(&saved.id)? {
            saved.created_at = existing.created_at;
        }
        saved.updated_at = Utc::now();

        let mut json = serde_json::to_string_pretty(&saved)?;
        json.push('\n');
        atomic_write(&dir.join("agent.json"), json.as_bytes())?;

        let soul = if saved.soul.is_empty() {
            String::new()
        } else {
            format!("{}\n", saved.soul)
        };
        atomic_write(&dir.join("SOUL.md"), soul.as_bytes())?;

        info!(agent_id = %saved.id, "persona saved");
        Ok(saved)
    }

    /// Every readable persona, sorted by id.
    pub fn list(&self) -> Result<Vec<Persona>> {
        let mut ids: Vec<String> = std::fs::read_dir(&self.root)?
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|id| is_valid_agent_id(id))
            .collect();
        ids.sort();

        let mut personas = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id) {
                Ok(Some(p)) => personas.push(p),
                Ok(None) => {}
                Err(e) => warn!(agent_id = %id, error = %e, "skipping unreadable persona"),
            }
        }
        Ok(personas)
    }

    /// Enabled personas, sorted by id.
    pub fn list_enabled(&self) -> Result<Vec<Persona>> {
        Ok(self.list()?.into_iter().filter(|p| p.enabled).collect())
    }

    /// Remove an agent directory. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let dir = self.agent_dir(id)?;
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        info!(agent_id = %id, "persona deleted");
        Ok(true)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
