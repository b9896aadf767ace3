//! State shared by every provider implementation
//!
//! Each provider owns one [`ProviderCore`] holding its configuration, cached
//! status and usage statistics. Locks are never held across an await.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::debug;

use crate::config::{ProviderConfig, ProviderConfigPatch};
use crate::health_check::{ProviderStatus, StatusCache};
use crate::models::{ChatRequest, ModelDescriptor, TokenUsage};
use crate::usage::UsageStats;

/// How a provider prices its traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Billing {
    /// Priced from the model descriptor's per-1K-token rates
    PerToken,
    /// Always zero, whatever the catalog says
    Free,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configuration, status cache and usage stats of one provider
#[derive(Debug)]
pub struct ProviderCore {
    name: String,
    billing: Billing,
    config: RwLock<ProviderConfig>,
    status: Mutex<StatusCache>,
    usage: Mutex<UsageStats>,
}

impl ProviderCore {
    pub fn new(config: ProviderConfig, billing: Billing) -> Self {
        Self {
            name: config.name.clone(),
            billing,
            config: RwLock::new(config),
            status: Mutex::new(StatusCache::default()),
            usage: Mutex::new(UsageStats::default()),
        }
    }

    /// Immutable provider key
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn billing(&self) -> Billing {
        self.billing
    }

    fn read_config(&self) -> RwLockReadGuard<'_, ProviderConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_config(&self) -> RwLockWriteGuard<'_, ProviderConfig> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> ProviderConfig {
        self.read_config().clone()
    }

    /// Merge a patch and drop the cached status
    pub fn update_config(&self, patch: ProviderConfigPatch) {
        self.write_config().apply(patch);
        self.invalidate_status();
        debug!("Updated configuration for provider {}", self.name);
    }

    /// Replace the model catalog wholesale
    pub fn replace_models(&self, models: Vec<ModelDescriptor>) {
        self.write_config().models = models;
    }

    pub fn models(&self) -> Vec<ModelDescriptor> {
        self.read_config().models.clone()
    }

    pub fn model(&self, id: &str) -> Option<ModelDescriptor> {
        self.read_config()
            .models
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Model for a request: explicit, then configured default, then the
    /// first catalog entry
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        if let Some(model) = requested.filter(|m| !m.is_empty()) {
            return model.to_string();
        }
        let config = self.read_config();
        config
            .default_model
            .clone()
            .or_else(|| config.models.first().map(|m| m.id.clone()))
            .unwrap_or_default()
    }

    /// Request timeout, falling back to the backend default
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.read_config().timeout().unwrap_or(default)
    }

    /// Cost of a settled call
    pub fn cost_for(&self, model: &str, usage: &TokenUsage) -> f64 {
        if self.billing == Billing::Free {
            return 0.0;
        }
        self.model(model)
            .and_then(|m| m.pricing)
            .map(|p| p.cost(usage.prompt_tokens as f64, usage.completion_tokens as f64))
            .unwrap_or(0.0)
    }

    /// Pre-flight cost estimate from prompt length and the output cap
    pub fn estimate_cost(&self, request: &ChatRequest) -> f64 {
        if self.billing == Billing::Free {
            return 0.0;
        }
        let model_id = self.resolve_model(request.model.as_deref());
        let Some(model) = self.model(&model_id) else {
            return 0.0;
        };
        let Some(pricing) = model.pricing else {
            return 0.0;
        };
        let input_tokens = request.estimated_prompt_tokens() as f64;
        let output_tokens = match request.max_tokens {
            Some(max_tokens) => max_tokens as f64,
            None => model.max_tokens as f64 * 0.1,
        };
        pricing.cost(input_tokens, output_tokens)
    }

    pub fn record_success(&self, model: &str, usage: &TokenUsage, elapsed: Duration) {
        let cost = self.cost_for(model, usage);
        lock(&self.usage).record(usage.total_tokens, cost, elapsed, false);
    }

    pub fn record_failure(&self, elapsed: Duration) {
        lock(&self.usage).record(0, 0.0, elapsed, true);
    }

    pub fn usage_stats(&self) -> UsageStats {
        lock(&self.usage).clone()
    }

    pub fn reset_usage_stats(&self) {
        *lock(&self.usage) = UsageStats::default();
    }

    pub fn cached_status(&self) -> Option<ProviderStatus> {
        lock(&self.status).get()
    }

    pub fn store_status(&self, status: ProviderStatus) {
        lock(&self.status).set(status);
    }

    pub fn invalidate_status(&self) {
        lock(&self.status).invalidate();
    }
}
