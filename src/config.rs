use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncConfig {
    /// Bundled document used to seed an empty store, so first run works
    /// with no network.
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
    /// Ordered source list (file paths or HTTP URLs). When two sources
    /// carry the same entry id, the later source wins.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Character budget for assembled reference context. Sized to leave
    /// headroom for the system prompt, history, and response within the
    /// model's context window.
    #[serde(default = "default_budget_chars")]
    pub budget_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            budget_chars: default_budget_chars(),
        }
    }
}

fn default_budget_chars() -> usize {
    7000
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Durable history file (JSON). Defaults next to the database.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_conversations: default_max_conversations(),
            max_messages: default_max_messages(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_max_conversations() -> usize {
    50
}
fn default_max_messages() -> usize {
    100
}
fn default_debounce_ms() -> u64 {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Base URL of the local llama-server instance.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Base system instructions. Retrieved reference material is appended
    /// per query.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_model() -> String {
    "llama-3.2-1b-instruct".to_string()
}
fn default_max_tokens() -> i32 {
    1024
}
fn default_temperature() -> f32 {
    0.7
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer using the reference material when \
     it is relevant, and say so plainly when you do not know."
        .to_string()
}

impl Config {
    /// Durable history file path, defaulting to `history.json` next to the
    /// database.
    pub fn history_path(&self) -> PathBuf {
        match &self.history.path {
            Some(p) => p.clone(),
            None => self
                .db
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("history.json"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.retrieval.budget_chars == 0 {
        anyhow::bail!("retrieval.budget_chars must be > 0");
    }

    if config.history.max_messages == 0 {
        anyhow::bail!("history.max_messages must be > 0");
    }

    if config.history.max_conversations == 0 {
        anyhow::bail!("history.max_conversations must be > 0");
    }

    if config.sync.fetch_timeout_secs == 0 {
        anyhow::bail!("sync.fetch_timeout_secs must be > 0");
    }

    Ok(config)
}
