//! Provider factories and the priority-ordered provider set.
//!
//! The gateway iterates providers in the order configuration lists them;
//! entries that are not configured (no key, feature not compiled in) are
//! skipped at startup with a warning rather than failing the worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{LlmProvider, ProviderError};
use crate::config::GatewayConfig;

/// Factory for creating a provider from its configuration block.
pub trait ProviderFactory: Send + Sync {
    /// Unique identifier, matching entries in `provider_priority`.
    fn provider_type(&self) -> &'static str;

    /// Create a provider instance from JSON configuration.
    fn create(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError>;

    /// Validate configuration without creating a provider.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError>;

    /// Human-readable description.
    fn description(&self) -> &'static str {
        "LLM provider"
    }
}

/// The providers the gateway fails over across, in priority order.
pub struct ProviderSet {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl ProviderSet {
    /// Build from explicit instances, kept in the given order.
    pub fn from_providers(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        Self { providers }
    }

    /// Build from configuration using the registered factories.
    ///
    /// Priority entries with no registered factory or failing configuration
    /// are skipped with a warning; at least one provider must survive.
    pub fn from_config(
        config: &GatewayConfig,
        factories: &[Arc<dyn ProviderFactory>],
    ) -> Result<Self, ProviderError> {
        let by_type: BTreeMap<&str, &Arc<dyn ProviderFactory>> = factories
            .iter()
            .map(|f| (f.provider_type(), f))
            .collect();

        let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
        for name in &config.provider_priority {
            let Some(factory) = by_type.get(name.as_str()) else {
                tracing::warn!(provider = %name, "no factory for configured provider, skipping");
                continue;
            };
            let provider_config = config
                .providers
                .get(name)
                .cloned()
                .unwrap_or(JsonValue::Null);
            match factory.create(&provider_config) {
                Ok(provider) => {
                    tracing::info!(provider = %name, "provider enabled");
                    providers.push(provider);
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "provider unavailable, skipping");
                }
            }
        }

        if providers.is_empty() {
            return Err(ProviderError::NotConfigured(
                "no LLM providers configured".to_string(),
            ));
        }
        Ok(Self { providers })
    }

    /// Providers in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn LlmProvider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Names in priority order, for health reporting.
    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("providers", &self.names())
            .finish()
    }
}

/// All factories compiled into this build.
pub fn builtin_factories() -> Vec<Arc<dyn ProviderFactory>> {
    #[allow(unused_mut)]
    let mut factories: Vec<Arc<dyn ProviderFactory>> = Vec::new();
    #[cfg(feature = "openai")]
    factories.push(Arc::new(super::OpenAiProviderFactory));
    #[cfg(feature = "anthropic")]
    factories.push(Arc::new(super::AnthropicProviderFactory));
    #[cfg(feature = "local")]
    factories.push(Arc::new(super::LocalProviderFactory));
    factories
}
