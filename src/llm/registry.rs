//! Analyst registry: builds providers from config, resolves `auto`

use super::{AnthropicAnalyst, IncidentAnalyst, LoggingAnalyst, OpenAiAnalyst};
use crate::config::{LlmConfig, LlmProvider};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available analyst providers
pub struct AnalystRegistry {
    analysts: HashMap<&'static str, Arc<dyn IncidentAnalyst>>,
    preferred: LlmProvider,
}

impl AnalystRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let mut analysts: HashMap<&'static str, Arc<dyn IncidentAnalyst>> = HashMap::new();

        if let Some(key) = &config.anthropic_api_key {
            match AnthropicAnalyst::new(key.clone()) {
                Ok(analyst) => {
                    analysts.insert(
                        "anthropic",
                        Arc::new(LoggingAnalyst::new(Arc::new(analyst))),
                    );
                }
                Err(e) => tracing::warn!(error = %e, "Anthropic analyst unavailable"),
            }
        }
        if let Some(key) = &config.openai_api_key {
            match OpenAiAnalyst::new(key.clone()) {
                Ok(analyst) => {
                    analysts.insert("openai", Arc::new(LoggingAnalyst::new(Arc::new(analyst))));
                }
                Err(e) => tracing::warn!(error = %e, "OpenAI analyst unavailable"),
            }
        }

        Self {
            analysts,
            preferred: config.provider,
        }
    }

    /// Create an empty registry for testing purposes
    pub fn new_empty() -> Self {
        Self {
            analysts: HashMap::new(),
            preferred: LlmProvider::Auto,
        }
    }

    pub fn has_analysts(&self) -> bool {
        !self.analysts.is_empty()
    }

    /// Resolve the analyst for a per-service provider preference
    /// (`"openai"`, `"anthropic"`, or `"auto"`), falling back to the
    /// registry-wide preference, then to any configured provider.
    pub fn select(&self, policy_provider: &str) -> Option<Arc<dyn IncidentAnalyst>> {
        let preference = LlmProvider::parse(policy_provider).unwrap_or(self.preferred);
        match preference {
            LlmProvider::Anthropic => self.analysts.get("anthropic").cloned(),
            LlmProvider::OpenAi => self.analysts.get("openai").cloned(),
            LlmProvider::Auto => self
                .analysts
                .get("anthropic")
                .or_else(|| self.analysts.get("openai"))
                .cloned(),
        }
    }

    /// Provider labels that were configured, sorted for stable output
    pub fn available(&self) -> Vec<&'static str> {
        let mut labels: Vec<_> = self.analysts.keys().copied().collect();
        labels.sort_unstable();
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_selects_nothing() {
        let registry = AnalystRegistry::new_empty();
        assert!(!registry.has_analysts());
        assert!(registry.select("auto").is_none());
    }

    #[test]
    fn test_registry_builds_from_keys() {
        let config = LlmConfig {
            provider: LlmProvider::Auto,
            openai_api_key: Some("sk-test".into()),
            anthropic_api_key: Some("sk-ant-test".into()),
        };
        let registry = AnalystRegistry::new(&config);
        assert_eq!(registry.available(), vec!["anthropic", "openai"]);

        // Auto prefers Anthropic when both are present.
        let selected = registry.select("auto").unwrap();
        assert_eq!(selected.provider_id(), "anthropic");
        let selected = registry.select("openai").unwrap();
        assert_eq!(selected.provider_id(), "openai");

        // Unknown policy strings fall back to the registry preference.
        let selected = registry.select("bogus").unwrap();
        assert_eq!(selected.provider_id(), "anthropic");
    }
}
