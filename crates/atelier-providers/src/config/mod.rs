//! Configuration for providers and the provider manager
//!
//! Provider and manager settings are plain serde structs. [`ProvidersFile`]
//! adds YAML loading with layered precedence:
//! 1. Environment variables (highest priority)
//! 2. Project config (`./.atelier/providers.yaml`)
//! 3. Global config (`~/.atelier/providers.yaml`)
//! 4. Built-in defaults (lowest priority)

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::models::ModelDescriptor;

fn default_enabled() -> bool {
    true
}

/// Settings for a single provider instance
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider key, used for lookup and routing
    pub name: String,
    /// Human-readable name
    #[serde(default)]
    pub display_name: String,
    /// API key; empty for backends that need none
    #[serde(default)]
    pub api_key: String,
    /// Base URL for the provider (for self-hosted or proxy)
    #[serde(default)]
    pub base_url: String,
    /// Whether the provider may serve requests
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Model catalog; the backend's defaults when empty
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
    /// Model used when a request names none
    #[serde(default)]
    pub default_model: Option<String>,
    /// Sampling temperature override
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Request timeout override, in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Retry attempt override for the manager
    #[serde(default)]
    pub retry_count: Option<u32>,
    /// Output token cap override
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ProviderConfig {
    /// Create an enabled config with every optional field unset
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: String::new(),
            api_key: String::new(),
            base_url: String::new(),
            enabled: true,
            models: Vec::new(),
            default_model: None,
            temperature: None,
            timeout_secs: None,
            retry_count: None,
            max_tokens: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_models(mut self, models: Vec<ModelDescriptor>) -> Self {
        self.models = models;
        self
    }

    /// Request timeout, when overridden
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Fill every empty field from backend defaults
    pub fn fill_defaults(
        &mut self,
        display_name: &str,
        base_url: &str,
        models: &[ModelDescriptor],
    ) {
        if self.display_name.is_empty() {
            self.display_name = display_name.to_string();
        }
        if self.base_url.is_empty() {
            self.base_url = base_url.to_string();
        }
        if self.models.is_empty() {
            self.models = models.to_vec();
        }
    }

    /// Merge the set fields of a patch. The name never changes.
    pub fn apply(&mut self, patch: ProviderConfigPatch) {
        if let Some(display_name) = patch.display_name {
            self.display_name = display_name;
        }
        if let Some(api_key) = patch.api_key {
            self.api_key = api_key;
        }
        if let Some(base_url) = patch.base_url {
            self.base_url = base_url;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(models) = patch.models {
            self.models = models;
        }
        if let Some(default_model) = patch.default_model {
            self.default_model = Some(default_model);
        }
        if let Some(temperature) = patch.temperature {
            self.temperature = Some(temperature);
        }
        if let Some(timeout_secs) = patch.timeout_secs {
            self.timeout_secs = Some(timeout_secs);
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = Some(retry_count);
        }
        if let Some(max_tokens) = patch.max_tokens {
            self.max_tokens = Some(max_tokens);
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let api_key = if self.api_key.is_empty() { "" } else { "[REDACTED]" };
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("api_key", &api_key)
            .field("base_url", &self.base_url)
            .field("enabled", &self.enabled)
            .field("models", &self.models.iter().map(|m| &m.id).collect::<Vec<_>>())
            .field("default_model", &self.default_model)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .field("retry_count", &self.retry_count)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Partial update for a [`ProviderConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfigPatch {
    pub display_name: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub enabled: Option<bool>,
    pub models: Option<Vec<ModelDescriptor>>,
    pub default_model: Option<String>,
    pub temperature: Option<f32>,
    pub timeout_secs: Option<u64>,
    pub retry_count: Option<u32>,
    pub max_tokens: Option<u32>,
}

/// Retry and fallback policy of the provider manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Attempts per request against the primary provider
    pub retry_attempts: u32,
    /// Base delay of the linear backoff, in milliseconds
    pub retry_delay_ms: u64,
    /// Whether fallback providers are tried after the primary gives up
    pub enable_fallback: bool,
    /// Fallback provider names, in the order they are tried
    pub fallback_providers: Vec<String>,
    /// Provider made active as soon as it is registered
    pub default_provider: Option<String>,
    /// Consecutive hinted rate-limit waits allowed within one attempt
    pub max_rate_limit_waits: u32,
}

impl ManagerConfig {
    /// Base delay of the linear backoff
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Delay after the given failed attempt, saturating on overflow
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_delay()
            .checked_mul(attempt)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 1000,
            enable_fallback: true,
            fallback_providers: Vec::new(),
            default_provider: None,
            max_rate_limit_waits: 5,
        }
    }
}

/// A provider declaration in a providers file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Backend kind, e.g. `openai`, `anthropic`, `ollama`
    pub kind: String,
    /// Provider settings
    #[serde(flatten)]
    pub config: ProviderConfig,
}

/// Contents of a providers YAML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvidersFile {
    /// Manager policy; defaults when absent
    #[serde(default)]
    pub manager: Option<ManagerConfig>,
    /// Declared providers
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl ProvidersFile {
    /// Parse a providers file from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ProviderError> {
        serde_yaml::from_str(content)
            .map_err(|e| ProviderError::ConfigFile(format!("Failed to parse config file: {}", e)))
    }

    /// Load a providers file; a missing file yields an empty one
    pub fn load_from_file(path: &Path) -> Result<Self, ProviderError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ProviderError::ConfigFile(format!("Failed to read {}: {}", path.display(), e))
        })?;
        debug!("Loaded providers file {}", path.display());
        Self::from_yaml(&content)
    }

    /// Load with precedence: env > project file > global file > defaults
    pub fn load_with_precedence() -> Result<Self, ProviderError> {
        let mut file = match Self::global_config_path() {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        file.merge(Self::load_from_file(&Self::project_config_path())?);
        file.apply_env();
        Ok(file)
    }

    /// Global configuration path
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".atelier").join("providers.yaml"))
    }

    /// Project configuration path
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".atelier").join("providers.yaml")
    }

    /// Overlay another file: its manager section wins when present, and its
    /// providers replace same-named ones or are appended
    pub fn merge(&mut self, other: ProvidersFile) {
        if other.manager.is_some() {
            self.manager = other.manager;
        }
        for entry in other.providers {
            match self
                .providers
                .iter_mut()
                .find(|existing| existing.config.name == entry.config.name)
            {
                Some(existing) => *existing = entry,
                None => self.providers.push(entry),
            }
        }
    }

    /// Override API keys from `<NAME>_API_KEY` variables, reading `.env` first
    pub fn apply_env(&mut self) {
        dotenv::dotenv().ok();
        for entry in &mut self.providers {
            let var = api_key_env_var(&entry.config.name);
            if let Ok(api_key) = std::env::var(&var) {
                debug!("Using {} for provider {}", var, entry.config.name);
                entry.config.api_key = api_key;
            }
        }
    }

    /// Manager policy, defaulted when the file has none
    pub fn manager_config(&self) -> ManagerConfig {
        self.manager.clone().unwrap_or_default()
    }
}

/// Environment variable carrying the API key of provider `name`
pub fn api_key_env_var(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}_API_KEY", normalized)
}
