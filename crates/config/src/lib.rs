//! Configuration loading, validation, and management for Loupe.
//!
//! Loads configuration from `~/.loupe/config.toml` with environment
//! variable overrides. Validates all settings at startup so a bad ceiling
//! or threshold fails fast instead of misbehaving mid-request.

use std::path::{Path, PathBuf};

use loupe_core::error::Error;
use loupe_core::policy::{
    BudgetPolicy, CachePolicy, EvictionPolicy, IntentPolicy, RetryPolicy, SelectionLimits,
};
use serde::{Deserialize, Serialize};

/// The root configuration structure.
///
/// Maps directly to `~/.loupe/config.toml`.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Selection ceilings per session
    #[serde(default)]
    pub limits: SelectionLimits,

    /// Token budget ceiling and status thresholds
    #[serde(default)]
    pub budget: BudgetPolicy,

    /// Truncation priorities
    #[serde(default)]
    pub eviction: EvictionPolicy,

    /// Intent classifier knobs
    #[serde(default)]
    pub intent: IntentPolicy,

    /// Session-state and token-counter cache bounds
    #[serde(default)]
    pub cache: CachePolicy,

    /// Provider timeout/retry/backoff
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Structured generation provider endpoint
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Persistence backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Request-level chat settings
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Structured generation provider settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Endpoint base URL; empty disables the structured path entirely
    #[serde(default)]
    pub base_url: String,

    /// Bearer token for the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model identifier requested from the provider
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    "research-gen-1".into()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            model: default_model(),
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("limits", &self.limits)
            .field("budget", &self.budget)
            .field("eviction", &self.eviction)
            .field("intent", &self.intent)
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .field("provider", &self.provider)
            .field("store", &self.store)
            .field("chat", &self.chat)
            .finish()
    }
}

/// Persistence backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "sqlite" or "in_memory"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// SQLite database path (ignored for in_memory)
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_backend() -> String {
    "sqlite".into()
}

fn default_db_path() -> String {
    "loupe.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
        }
    }
}

/// Request-level chat settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Maximum user message length, in characters
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// How many results generation handlers request
    #[serde(default = "default_result_count")]
    pub result_count: usize,

    /// Maximum items selectable from one picker chunk
    #[serde(default = "default_max_selectable")]
    pub max_selectable: usize,

    /// Knowledge search result limit for retrieval handlers
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,

    /// Default generation temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_content_chars() -> usize {
    32_768
}
fn default_result_count() -> usize {
    5
}
fn default_max_selectable() -> usize {
    10
}
fn default_search_limit() -> usize {
    10
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_content_chars: default_max_content_chars(),
            result_count: default_result_count(),
            max_selectable: default_max_selectable(),
            search_limit: default_search_limit(),
            temperature: default_temperature(),
        }
    }
}

impl AppConfig {
    /// The default config file path: `~/.loupe/config.toml`.
    pub fn config_path() -> PathBuf {
        Self::home_dir().join(".loupe").join("config.toml")
    }

    fn home_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Load from the default path, falling back to defaults when the file
    /// does not exist. Environment overrides apply either way.
    pub fn load_default() -> Result<Self, Error> {
        let path = Self::config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|e| Error::Config {
            message: format!("Failed to parse {}: {e}", path.display()),
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides, highest precedence.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("LOUPE_API_KEY")
            && !key.is_empty()
        {
            self.provider.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("LOUPE_PROVIDER_URL")
            && !url.is_empty()
        {
            self.provider.base_url = url;
        }
        if let Ok(limit) = std::env::var("LOUPE_TOKEN_LIMIT")
            && let Ok(limit) = limit.parse::<usize>()
        {
            self.budget.token_limit = limit;
        }
        if let Ok(path) = std::env::var("LOUPE_DB_PATH")
            && !path.is_empty()
        {
            self.store.path = path;
        }
    }

    /// Validate every setting; called by the loaders.
    pub fn validate(&self) -> Result<(), Error> {
        if self.limits.max_total == 0 || self.limits.max_per_type == 0 {
            return Err(Error::Config {
                message: "selection limits must be greater than zero".into(),
            });
        }
        if self.limits.max_per_type > self.limits.max_total {
            return Err(Error::Config {
                message: format!(
                    "per-type limit {} exceeds total limit {}",
                    self.limits.max_per_type, self.limits.max_total
                ),
            });
        }
        if self.budget.token_limit == 0 {
            return Err(Error::Config {
                message: "budget.token_limit must be greater than zero".into(),
            });
        }
        let warning = self.budget.warning_threshold;
        let critical = self.budget.critical_threshold;
        if !(0.0..=1.0).contains(&warning) || !(0.0..=1.0).contains(&critical) {
            return Err(Error::Config {
                message: "budget thresholds must be within [0, 1]".into(),
            });
        }
        if warning >= critical {
            return Err(Error::Config {
                message: format!(
                    "warning threshold {warning} must be below critical threshold {critical}"
                ),
            });
        }
        if !(0.0..1.0).contains(&self.intent.min_confidence) {
            return Err(Error::Config {
                message: "intent.min_confidence must be within [0, 1)".into(),
            });
        }
        if self.intent.full_score <= 0.0 {
            return Err(Error::Config {
                message: "intent.full_score must be positive".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.chat.temperature) {
            return Err(Error::Config {
                message: "chat.temperature must be within [0, 2]".into(),
            });
        }
        if self.chat.result_count == 0 || self.chat.max_selectable == 0 {
            return Err(Error::Config {
                message: "chat.result_count and chat.max_selectable must be positive".into(),
            });
        }
        match self.store.backend.as_str() {
            "sqlite" | "in_memory" => {}
            other => {
                return Err(Error::Config {
                    message: format!("unknown store backend '{other}'"),
                });
            }
        }
        Ok(())
    }

    /// Whether the structured provider path is configured at all.
    pub fn provider_enabled(&self) -> bool {
        !self.provider.base_url.is_empty()
    }
}
