//! Configuration loading and management for MClaw.
//!
//! The configuration is a single JSON document (default
//! `~/.mclaw/config.json`), with every leaf field overridable through
//! `MCLAW_`-prefixed environment variables whose names follow the section
//! path (e.g. `MCLAW_AGENTS_DEFAULTS_MODEL`, `MCLAW_MEMORY_TOP_K`).
//! A missing file yields defaults; a malformed file is an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub channels: ChannelsConfig,
    pub providers: ProvidersConfig,
    pub tools: ToolsConfig,
    pub memory: MemoryConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    /// Workspace path; supports `~/` and `./` prefixes.
    pub workspace: String,
    /// Primary model name (provider-prefixed, e.g. "anthropic/claude-sonnet-4").
    pub model: String,
    /// Ordered fallback list tried on rate-limit errors.
    pub fallback_models: Vec<String>,
    /// Context window used for token estimates.
    pub max_tokens: u32,
    /// Default sampling temperature.
    pub temperature: f32,
    /// Agent loop bound.
    pub max_tool_iterations: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "./mclaw/workspace".into(),
            model: "glm-4.7".into(),
            fallback_models: Vec::new(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub telegram: TelegramConfig,
    pub discord: DiscordConfig,
    pub whatsapp: WhatsAppConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: String,
    /// Allowlist of sender IDs. Empty = allow all.
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub enabled: bool,
    pub token: String,
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    pub bridge_url: String,
    pub allow_from: Vec<String>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_url: "ws://localhost:3001".into(),
            allow_from: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
    pub openrouter: ProviderConfig,
    pub groq: ProviderConfig,
    pub zhipu: ProviderConfig,
    pub vllm: ProviderConfig,
    pub gemini: ProviderConfig,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_base: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field(
                "api_key",
                &if self.api_key.is_empty() { "" } else { "[REDACTED]" },
            )
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub web: WebToolsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebToolsConfig {
    pub search: WebSearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSearchConfig {
    pub api_key: String,
    pub max_results: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 5,
        }
    }
}

/// Controls the intelligent memory layer. Embeddings use Gemini
/// text-embedding-004; if `api_key` is empty, falls back to
/// `providers.gemini.api_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub api_key: String,
    pub api_base: String,
    /// Max memories to recall per turn.
    pub top_k: usize,
    /// Min cosine similarity for recall.
    pub min_score: f64,
    /// Per-user memory cap enforced by pruning.
    pub max_memories: usize,
    /// LLM for extraction/consolidation (empty = agent model).
    pub extract_model: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            api_base: String::new(),
            top_k: 5,
            min_score: 0.3,
            max_memories: 1000,
            extract_model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Ticker interval in seconds.
    pub interval_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 600,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agents: AgentsConfig::default(),
            channels: ChannelsConfig::default(),
            providers: ProvidersConfig::default(),
            tools: ToolsConfig::default(),
            memory: MemoryConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl Config {
    /// Default config file path: `~/.mclaw/config.json`.
    pub fn default_path() -> PathBuf {
        home_dir().join(".mclaw").join("config.json")
    }

    /// Load configuration from the default path with env overrides applied.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from a specific file path with env overrides applied.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Persist the configuration as pretty-printed JSON, creating parent dirs.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, data).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// The expanded workspace directory.
    pub fn workspace_path(&self) -> PathBuf {
        expand_path(&self.agents.defaults.workspace)
    }

    /// Parent of the workspace — sessions, memory.db, and job stores live here.
    pub fn data_dir(&self) -> PathBuf {
        self.workspace_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.workspace_path())
    }

    /// Apply `MCLAW_*` environment overrides to every recognized leaf field.
    pub fn apply_env_overrides(&mut self) {
        let d = &mut self.agents.defaults;
        env_string("MCLAW_AGENTS_DEFAULTS_WORKSPACE", &mut d.workspace);
        env_string("MCLAW_AGENTS_DEFAULTS_MODEL", &mut d.model);
        env_list("MCLAW_AGENTS_DEFAULTS_FALLBACK_MODELS", &mut d.fallback_models);
        env_parse("MCLAW_AGENTS_DEFAULTS_MAX_TOKENS", &mut d.max_tokens);
        env_parse("MCLAW_AGENTS_DEFAULTS_TEMPERATURE", &mut d.temperature);
        env_parse(
            "MCLAW_AGENTS_DEFAULTS_MAX_TOOL_ITERATIONS",
            &mut d.max_tool_iterations,
        );

        let t = &mut self.channels.telegram;
        env_parse("MCLAW_CHANNELS_TELEGRAM_ENABLED", &mut t.enabled);
        env_string("MCLAW_CHANNELS_TELEGRAM_TOKEN", &mut t.token);
        env_list("MCLAW_CHANNELS_TELEGRAM_ALLOW_FROM", &mut t.allow_from);

        let dc = &mut self.channels.discord;
        env_parse("MCLAW_CHANNELS_DISCORD_ENABLED", &mut dc.enabled);
        env_string("MCLAW_CHANNELS_DISCORD_TOKEN", &mut dc.token);
        env_list("MCLAW_CHANNELS_DISCORD_ALLOW_FROM", &mut dc.allow_from);

        let w = &mut self.channels.whatsapp;
        env_parse("MCLAW_CHANNELS_WHATSAPP_ENABLED", &mut w.enabled);
        env_string("MCLAW_CHANNELS_WHATSAPP_BRIDGE_URL", &mut w.bridge_url);
        env_list("MCLAW_CHANNELS_WHATSAPP_ALLOW_FROM", &mut w.allow_from);

        for (name, p) in [
            ("ANTHROPIC", &mut self.providers.anthropic),
            ("OPENAI", &mut self.providers.openai),
            ("OPENROUTER", &mut self.providers.openrouter),
            ("GROQ", &mut self.providers.groq),
            ("ZHIPU", &mut self.providers.zhipu),
            ("VLLM", &mut self.providers.vllm),
            ("GEMINI", &mut self.providers.gemini),
        ] {
            env_string(&format!("MCLAW_PROVIDERS_{name}_API_KEY"), &mut p.api_key);
            env_string(&format!("MCLAW_PROVIDERS_{name}_API_BASE"), &mut p.api_base);
        }

        let s = &mut self.tools.web.search;
        env_string("MCLAW_TOOLS_WEB_SEARCH_API_KEY", &mut s.api_key);
        env_parse("MCLAW_TOOLS_WEB_SEARCH_MAX_RESULTS", &mut s.max_results);

        let m = &mut self.memory;
        env_parse("MCLAW_MEMORY_ENABLED", &mut m.enabled);
        env_string("MCLAW_MEMORY_API_KEY", &mut m.api_key);
        env_string("MCLAW_MEMORY_API_BASE", &mut m.api_base);
        env_parse("MCLAW_MEMORY_TOP_K", &mut m.top_k);
        env_parse("MCLAW_MEMORY_MIN_SCORE", &mut m.min_score);
        env_parse("MCLAW_MEMORY_MAX_MEMORIES", &mut m.max_memories);
        env_string("MCLAW_MEMORY_EXTRACT_MODEL", &mut m.extract_model);

        let h = &mut self.heartbeat;
        env_parse("MCLAW_HEARTBEAT_ENABLED", &mut h.enabled);
        env_parse("MCLAW_HEARTBEAT_INTERVAL_SECONDS", &mut h.interval_seconds);
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn env_list(key: &str, target: &mut Vec<String>) {
    if let Ok(v) = std::env::var(key) {
        *target = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        } else {
            tracing::warn!(var = key, value = %v, "Ignoring unparseable env override");
        }
    }
}

/// Resolve special path prefixes:
/// - `~/` expands to the user home directory
/// - `./` expands to the executable's directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    if path == "~" {
        return home_dir();
    }
    if let Some(rest) = path.strip_prefix("./") {
        return exe_dir().join(rest);
    }
    PathBuf::from(path)
}

fn home_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";

    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}
