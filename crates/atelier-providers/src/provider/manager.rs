//! Provider manager for orchestrating provider operations
//!
//! The manager owns the registered providers and the active-provider
//! pointer, and wraps non-streaming requests with retry, rate-limit waits
//! and fallback. Streaming requests go straight to the resolved provider:
//! output already handed to the caller cannot be replayed or switched to
//! another backend mid-stream.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{ChatStream, Provider, ProviderKind, ProviderRegistry};
use crate::config::{ManagerConfig, ProviderConfigPatch, ProviderEntry};
use crate::error::{ErrorKind, ProviderError};
use crate::health_check::ProviderStatus;
use crate::models::{ChatRequest, ChatResponse, ModelDescriptor};
use crate::usage::UsageStats;

struct ManagerState {
    registry: ProviderRegistry,
    active: Option<String>,
    config: ManagerConfig,
}

/// Central coordinator for provider operations
///
/// Registry and active-provider mutations happen under one lock that is
/// never held across an await, so each is atomic with respect to
/// concurrent requests.
pub struct ProviderManager {
    state: RwLock<ManagerState>,
}

impl ProviderManager {
    /// Create an empty manager
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            state: RwLock::new(ManagerState {
                registry: ProviderRegistry::new(),
                active: None,
                config,
            }),
        }
    }

    /// Build a manager pre-populated from provider declarations. Entries
    /// with an unknown kind or an invalid configuration are skipped.
    pub fn from_configs(config: ManagerConfig, entries: Vec<ProviderEntry>) -> Self {
        let manager = Self::new(config);
        for entry in entries {
            let name = entry.config.name.clone();
            let kind: ProviderKind = match entry.kind.parse() {
                Ok(kind) => kind,
                Err(_) => {
                    warn!("Skipping provider {}: unknown provider type {}", name, entry.kind);
                    continue;
                }
            };
            let registered = kind
                .build(entry.config)
                .and_then(|provider| manager.register(provider));
            if let Err(e) = registered {
                warn!("Skipping provider {}: {}", name, e);
            }
        }
        manager
    }

    fn state(&self) -> RwLockReadGuard<'_, ManagerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, ManagerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a provider. It becomes active when nothing is active yet or
    /// when it is the configured default.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<(), ProviderError> {
        let mut state = self.state_mut();
        let name = provider.name().to_string();
        state.registry.register(provider)?;

        let is_default = state.config.default_provider.as_deref() == Some(name.as_str());
        if state.active.is_none() || is_default {
            debug!("Provider {} is now active", name);
            state.active = Some(name.clone());
        }
        info!("Registered provider {}", name);
        Ok(())
    }

    /// Remove a provider. Removing the active provider activates the first
    /// remaining one, if any.
    pub fn remove(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let mut state = self.state_mut();
        let provider = state.registry.unregister(name)?;
        if state.active.as_deref() == Some(name) {
            state.active = state.registry.first().map(str::to_string);
            debug!("Active provider is now {:?}", state.active);
        }
        info!("Removed provider {}", name);
        Ok(provider)
    }

    /// Make a registered provider active; unknown names change nothing
    pub fn set_active(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state_mut();
        if !state.registry.has_provider(name) {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        state.active = Some(name.to_string());
        Ok(())
    }

    pub fn active_provider_name(&self) -> Option<String> {
        self.state().active.clone()
    }

    pub fn active_provider(&self) -> Option<Arc<dyn Provider>> {
        let state = self.state();
        state
            .active
            .as_deref()
            .and_then(|name| state.registry.get(name).ok())
    }

    /// Get a specific provider
    pub fn get_provider(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.state().registry.get(name)
    }

    /// Registered provider names in registration order
    pub fn provider_names(&self) -> Vec<String> {
        self.state().registry.names()
    }

    /// Models of one provider
    pub fn models(&self, name: &str) -> Result<Vec<ModelDescriptor>, ProviderError> {
        self.state().registry.list_models(name)
    }

    pub fn config(&self) -> ManagerConfig {
        self.state().config.clone()
    }

    pub fn update_config(&self, config: ManagerConfig) {
        self.state_mut().config = config;
    }

    /// The explicitly named provider, else the active one
    fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn Provider>, ProviderError> {
        let state = self.state();
        let name = match name {
            Some(name) => name,
            None => state
                .active
                .as_deref()
                .ok_or(ProviderError::NoProvider { requested: None })?,
        };
        state
            .registry
            .get(name)
            .map_err(|_| ProviderError::NoProvider {
                requested: Some(name.to_string()),
            })
    }

    /// Send a request with retry, rate-limit waits and fallback
    pub async fn send_message(
        &self,
        request: &ChatRequest,
        provider: Option<&str>,
    ) -> Result<ChatResponse, ProviderError> {
        let primary = self.resolve(provider)?;
        let config = self.config();
        let attempts = primary
            .config()
            .retry_count
            .unwrap_or(config.retry_attempts)
            .max(1);

        let mut last_error = None;
        let mut attempt = 1;
        let mut rate_limit_waits = 0;

        while attempt <= attempts {
            let err = match primary.send_message(request).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if err.kind() == ErrorKind::Authentication {
                warn!("Authentication failed for {}, not retrying", primary.name());
                last_error = Some(err);
                break;
            }

            if let Some(wait) = err.retry_after() {
                if rate_limit_waits < config.max_rate_limit_waits {
                    rate_limit_waits += 1;
                    warn!(
                        "Rate limited by {}, waiting {:?} before attempt {}/{}",
                        primary.name(),
                        wait,
                        attempt,
                        attempts
                    );
                    last_error = Some(err);
                    sleep(wait).await;
                    continue;
                }
            }
            rate_limit_waits = 0;

            if !err.is_retryable() {
                last_error = Some(err);
                break;
            }

            if attempt < attempts {
                let delay = config.backoff_delay(attempt);
                warn!(
                    "Attempt {}/{} on {} failed, retrying after {:?}: {}",
                    attempt,
                    attempts,
                    primary.name(),
                    delay,
                    err
                );
                sleep(delay).await;
            } else {
                warn!("Attempt {}/{} on {} failed: {}", attempt, attempts, primary.name(), err);
            }
            last_error = Some(err);
            attempt += 1;
        }

        if config.enable_fallback {
            for name in &config.fallback_providers {
                if name == primary.name() {
                    continue;
                }
                let fallback = match self.get_provider(name) {
                    Ok(fallback) => fallback,
                    Err(_) => {
                        debug!("Skipping unknown fallback provider {}", name);
                        continue;
                    }
                };
                if !fallback.is_available().await {
                    debug!("Skipping unavailable fallback provider {}", name);
                    continue;
                }

                info!("Falling back from {} to {}", primary.name(), name);
                match fallback.send_message(request).await {
                    Ok(response) => return Ok(response),
                    Err(err) => {
                        warn!("Fallback provider {} failed: {}", name, err);
                        last_error = Some(err);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProviderError::AllFailed(format!(
                "no provider could serve the request (primary: {})",
                primary.name()
            ))
        }))
    }

    /// Stream from the resolved provider, without retry or fallback
    pub async fn send_message_stream(
        &self,
        request: &ChatRequest,
        provider: Option<&str>,
    ) -> Result<ChatStream, ProviderError> {
        let provider = self.resolve(provider)?;
        provider.send_message_stream(request).await
    }

    /// Status of one provider
    pub async fn get_status(&self, name: &str) -> Result<ProviderStatus, ProviderError> {
        let provider = self.get_provider(name)?;
        Ok(provider.get_status().await)
    }

    /// Probe every provider concurrently, in registration order
    pub async fn get_all_statuses(&self) -> Vec<(String, ProviderStatus)> {
        let providers = self.state().registry.list_all();
        let statuses = join_all(providers.iter().map(|p| p.get_status())).await;
        providers
            .iter()
            .map(|p| p.name().to_string())
            .zip(statuses)
            .collect()
    }

    pub fn update_provider_config(
        &self,
        name: &str,
        patch: ProviderConfigPatch,
    ) -> Result<(), ProviderError> {
        self.get_provider(name)?.update_config(patch);
        Ok(())
    }

    pub async fn validate_provider_config(&self, name: &str) -> Result<bool, ProviderError> {
        let provider = self.get_provider(name)?;
        Ok(provider.validate_config().await)
    }

    /// Re-discover one provider's model catalog
    pub async fn refresh_models(&self, name: &str) -> Result<Vec<ModelDescriptor>, ProviderError> {
        let provider = self.get_provider(name)?;
        provider.refresh_models().await
    }

    pub fn usage_stats(&self, name: &str) -> Result<UsageStats, ProviderError> {
        Ok(self.get_provider(name)?.usage_stats())
    }

    /// Usage of every provider, in registration order
    pub fn all_usage_stats(&self) -> Vec<(String, UsageStats)> {
        self.state()
            .registry
            .list_all()
            .iter()
            .map(|p| (p.name().to_string(), p.usage_stats()))
            .collect()
    }

    /// Usage summed over every provider
    pub fn total_usage_stats(&self) -> UsageStats {
        self.all_usage_stats()
            .iter()
            .fold(UsageStats::default(), |total, (_, stats)| total.combine(stats))
    }

    /// Reset one provider's stats, or every provider's
    pub fn reset_usage_stats(&self, name: Option<&str>) -> Result<(), ProviderError> {
        match name {
            Some(name) => self.get_provider(name)?.reset_usage_stats(),
            None => {
                let providers = self.state().registry.list_all();
                for provider in providers {
                    provider.reset_usage_stats();
                }
            }
        }
        Ok(())
    }

    /// Cost estimate from the resolved provider, 0 when none resolves
    pub fn estimate_cost(&self, request: &ChatRequest, provider: Option<&str>) -> f64 {
        self.resolve(provider)
            .map(|p| p.estimate_cost(request))
            .unwrap_or(0.0)
    }
}

impl Default for ProviderManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}
