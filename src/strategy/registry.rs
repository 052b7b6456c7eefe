use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use super::{Provider, StrategyDescriptor};

/// Name-to-adapter table shared by every concurrent request.
///
/// Mutation and lookup follow a consistent-snapshot discipline: a lookup
/// observes the table strictly before or strictly after any mutation, and it
/// clones the `Arc` out, so an in-flight call keeps the adapter instance it
/// captured even across an unregister or reload.
pub struct StrategyRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns false when the name is already taken. That is an idempotency
    /// guard for callers, not an error: the existing adapter stays.
    pub fn register(&self, name: &str, provider: Arc<dyn Provider>) -> bool {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if providers.contains_key(name) {
            warn!("Strategy already registered, keeping existing: {}", name);
            return false;
        }
        providers.insert(name.to_string(), provider);
        info!("Registered strategy: {}", name);
        true
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            info!("Unregistered strategy: {}", name);
        } else {
            warn!("Cannot unregister unknown strategy: {}", name);
        }
        removed
    }

    /// `None` means not found. Defaulting to some other adapter is caller
    /// policy and lives in the manager, never here.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn metadata_for(&self, name: &str) -> Option<StrategyDescriptor> {
        let provider = self.get(name)?;
        Some(StrategyDescriptor {
            name: name.to_string(),
            capabilities: provider.capabilities(),
            metrics: provider.metrics(),
        })
    }

    pub fn descriptors(&self) -> Vec<StrategyDescriptor> {
        self.list_names()
            .into_iter()
            .filter_map(|name| self.metadata_for(&name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderResult;
    use crate::strategy::{CallContext, Capabilities, ProbeStatus, ProviderMetrics};
    use async_trait::async_trait;

    struct FixedProvider {
        name: String,
        output: String,
    }

    #[async_trait]
    impl Provider for FixedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_batch: false,
                max_batch_size: 1,
                supported_languages: Vec::new(),
                requires_credential: false,
            }
        }

        fn metrics(&self) -> ProviderMetrics {
            ProviderMetrics::default()
        }

        async fn translate(&self, _text: &str, _call: &CallContext) -> ProviderResult<String> {
            Ok(self.output.clone())
        }

        async fn test_connection(&self) -> ProbeStatus {
            ProbeStatus::Reachable { latency_ms: 0 }
        }

        fn update_config(&self, _config: crate::config::StrategyConfig) -> bool {
            true
        }
    }

    fn fixed(name: &str, output: &str) -> Arc<dyn Provider> {
        Arc::new(FixedProvider {
            name: name.to_string(),
            output: output.to_string(),
        })
    }

    fn call() -> CallContext {
        CallContext {
            source_lang: "en".to_string(),
            target_lang: "zh".to_string(),
            domain: None,
        }
    }

    #[test]
    fn duplicate_register_is_refused_and_keeps_the_original() {
        let registry = StrategyRegistry::new();
        assert!(registry.register("a", fixed("a", "first")));
        assert!(!registry.register("a", fixed("a", "second")));
        assert_eq!(registry.list_names(), vec!["a".to_string()]);
    }

    #[test]
    fn get_on_unknown_name_is_none() {
        let registry = StrategyRegistry::new();
        assert!(registry.get("ghost").is_none());
        assert!(registry.metadata_for("ghost").is_none());
    }

    #[tokio::test]
    async fn in_flight_call_survives_unregister() {
        let registry = StrategyRegistry::new();
        registry.register("a", fixed("a", "风"));

        // A caller captures the adapter, then the strategy is removed.
        let captured = registry.get("a").expect("registered");
        assert!(registry.unregister("a"));

        // The captured instance still completes normally.
        let translated = captured.translate("Wind", &call()).await.expect("translate");
        assert_eq!(translated, "风");

        // New lookups observe the removal.
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn list_names_is_sorted() {
        let registry = StrategyRegistry::new();
        registry.register("zeta", fixed("zeta", "z"));
        registry.register("alpha", fixed("alpha", "a"));
        assert_eq!(
            registry.list_names(),
            vec!["alpha".to_string(), "zeta".to_string()]
        );
    }
}
