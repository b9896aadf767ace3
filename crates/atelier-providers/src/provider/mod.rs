//! Provider trait, shared provider state, registry and manager

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    config::{ProviderConfig, ProviderConfigPatch},
    error::ProviderError,
    health_check::{ProviderStatus, PROBE_TIMEOUT},
    models::{ChatRequest, ChatResponse, ModelDescriptor, StreamChunk, TokenUsage},
    providers::{AnthropicProvider, OllamaProvider, OpenAiProvider},
    streaming::{assemble, EventStream},
    usage::UsageStats,
};

pub mod state;
pub mod manager;
pub mod registry;

pub use state::{Billing, ProviderCore};
pub use manager::ProviderManager;
pub use registry::ProviderRegistry;

/// A lazy, finite stream of chat chunks. The last item is the chunk with
/// `finished` set, unless the stream ends in an error.
pub type ChatStream = BoxStream<'static, Result<StreamChunk, ProviderError>>;

/// Core trait that all providers must implement
///
/// Implementations supply the network specifics (`probe`, `chat`,
/// `open_stream`). Status caching, usage accounting and cost estimation are
/// provided on top of the shared [`ProviderCore`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Shared configuration, status cache and usage stats
    fn core(&self) -> &Arc<ProviderCore>;

    /// Backend family of this provider
    fn kind(&self) -> ProviderKind;

    /// Minimal call confirming reachability and credentials
    async fn probe(&self) -> Result<(), ProviderError>;

    /// One non-streaming completion against `model`
    async fn chat(&self, request: &ChatRequest, model: &str) -> Result<ChatResponse, ProviderError>;

    /// Open a streaming completion against `model`
    async fn open_stream(&self, request: &ChatRequest, model: &str) -> Result<EventStream, ProviderError>;

    /// Whether an empty API key makes the configuration invalid
    fn requires_api_key(&self) -> bool {
        true
    }

    /// Re-discover the model catalog. Backends without discovery keep the
    /// configured catalog.
    async fn refresh_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
        Ok(self.models())
    }

    /// Get the provider's unique name
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Get the list of configured models
    fn models(&self) -> Vec<ModelDescriptor> {
        self.core().models()
    }

    /// Snapshot of the current configuration
    fn config(&self) -> ProviderConfig {
        self.core().config()
    }

    /// Cached status, or a fresh probe once the cached one has gone stale
    async fn get_status(&self) -> ProviderStatus {
        let core = self.core();
        if let Some(status) = core.cached_status() {
            return status;
        }

        let status = if !core.config().enabled {
            ProviderStatus::unavailable("provider disabled")
        } else {
            let started = Instant::now();
            match tokio::time::timeout(PROBE_TIMEOUT, self.probe()).await {
                Ok(Ok(())) => ProviderStatus::available(started.elapsed()),
                Ok(Err(e)) => ProviderStatus::unavailable(e.to_string()),
                Err(_) => ProviderStatus::unavailable(format!(
                    "Status probe timed out after {}s",
                    PROBE_TIMEOUT.as_secs()
                )),
            }
        };

        debug!(
            "Probed provider {}: available={}",
            self.name(),
            status.available
        );
        core.store_status(status.clone());
        status
    }

    /// Check if the provider is available
    async fn is_available(&self) -> bool {
        self.get_status().await.available
    }

    /// Send a chat completion request, recording usage once
    async fn send_message(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let core = self.core();
        let started = Instant::now();

        if !core.config().enabled {
            core.record_failure(started.elapsed());
            return Err(ProviderError::config(self.name(), "provider disabled"));
        }

        let model = core.resolve_model(request.model.as_deref());
        debug!("Sending chat request to {} for model: {}", self.name(), model);

        match self.chat(request, &model).await {
            Ok(response) => {
                let usage = response.usage.unwrap_or_else(|| {
                    TokenUsage::estimated(request.prompt_chars(), response.content.len())
                });
                core.record_success(&response.model, &usage, started.elapsed());
                Ok(response)
            }
            Err(err) => {
                core.record_failure(started.elapsed());
                Err(err)
            }
        }
    }

    /// Stream a chat completion. Usage is recorded once, when the stream
    /// settles.
    async fn send_message_stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let core = self.core();
        let started = Instant::now();

        if !core.config().enabled {
            core.record_failure(started.elapsed());
            return Err(ProviderError::config(self.name(), "provider disabled"));
        }

        let model = core.resolve_model(request.model.as_deref());
        debug!("Opening chat stream to {} for model: {}", self.name(), model);

        match self.open_stream(request, &model).await {
            Ok(events) => Ok(assemble(
                events,
                Arc::clone(core),
                model,
                request.prompt_chars(),
                started,
            )),
            Err(err) => {
                core.record_failure(started.elapsed());
                Err(err)
            }
        }
    }

    /// Merge configuration changes and force a re-probe
    fn update_config(&self, patch: ProviderConfigPatch) {
        self.core().update_config(patch);
    }

    /// Required fields present and a live probe succeeds
    async fn validate_config(&self) -> bool {
        let config = self.config();
        if self.requires_api_key() && config.api_key.trim().is_empty() {
            debug!("Provider {} has no API key", self.name());
            return false;
        }
        if config.base_url.trim().is_empty() {
            debug!("Provider {} has no base URL", self.name());
            return false;
        }
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, self.probe()).await,
            Ok(Ok(()))
        )
    }

    /// Pre-flight cost estimate; 0 when the model has no pricing
    fn estimate_cost(&self, request: &ChatRequest) -> f64 {
        self.core().estimate_cost(request)
    }

    fn usage_stats(&self) -> UsageStats {
        self.core().usage_stats()
    }

    fn reset_usage_stats(&self) {
        self.core().reset_usage_stats();
    }
}

/// Closed enumeration of supported backend families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Chat-completions style API with inline system messages
    OpenAi,
    /// Messages API with a separate top-level system field
    Anthropic,
    /// Local model host
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
        }
    }

    /// Construct a provider of this kind; unset fields take backend defaults
    pub fn build(self, config: ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
        Ok(match self {
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config)?),
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)?),
            ProviderKind::Ollama => Arc::new(OllamaProvider::new(config)?),
        })
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "ollama" | "local" => Ok(ProviderKind::Ollama),
            other => Err(ProviderError::config(
                other,
                format!("Unknown provider type: {}", other),
            )),
        }
    }
}
