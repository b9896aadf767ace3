//! Provider registry keyed by provider name

use std::collections::HashMap;
use std::sync::Arc;

use super::Provider;
use crate::error::ProviderError;
use crate::models::ModelDescriptor;

/// Registry for managing registered providers
///
/// Lookups are by name; iteration follows registration order.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    order: Vec<String>,
}

impl ProviderRegistry {
    /// Create a new empty provider registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new provider; names must be unique
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<(), ProviderError> {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            return Err(ProviderError::DuplicateProvider(name));
        }
        self.order.push(name.clone());
        self.providers.insert(name, provider);
        Ok(())
    }

    /// Unregister a provider by name
    pub fn unregister(&mut self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let provider = self
            .providers
            .remove(name)
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;
        self.order.retain(|n| n != name);
        Ok(provider)
    }

    /// Get a provider by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }

    /// All providers in registration order
    pub fn list_all(&self) -> Vec<Arc<dyn Provider>> {
        self.order
            .iter()
            .filter_map(|name| self.providers.get(name).cloned())
            .collect()
    }

    /// All provider names in registration order
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// First registered provider name, if any
    pub fn first(&self) -> Option<&str> {
        self.order.first().map(String::as_str)
    }

    /// Models for a specific provider
    pub fn list_models(&self, name: &str) -> Result<Vec<ModelDescriptor>, ProviderError> {
        Ok(self.get(name)?.models())
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
