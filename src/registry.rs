use std::collections::HashMap;
use std::sync::Arc;

use trigger_drive::DriveProvider;
use trigger_gmail::GmailProvider;
use trigger_plugin::message::{ChangeRecord, RawChange};
use trigger_plugin::plugin::{ClassifyFn, Provider, ProviderError};

use crate::error::EngineError;

/// Providers plus their classification table, keyed by (provider id, raw change kind).
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    classifiers: HashMap<(String, String), ClassifyFn>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The providers shipped with this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GmailProvider::new()));
        registry.register(Arc::new(DriveProvider::new()));
        registry
    }

    /// Replaces any provider already registered under the same id.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let id = provider.id().to_string();
        self.classifiers.retain(|(provider_id, _), _| provider_id != &id);
        for (kind, classify) in provider.classifiers() {
            self.classifiers.insert((id.clone(), kind.to_string()), classify);
        }
        self.providers.insert(id, provider);
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn Provider>, EngineError> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidConfig(format!("unknown provider {provider_id}")))
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn classify(&self, provider_id: &str, raw: &RawChange) -> Result<ChangeRecord, ProviderError> {
        let classify = self
            .classifiers
            .get(&(provider_id.to_string(), raw.kind.clone()))
            .ok_or_else(|| ProviderError::Decode(format!("{provider_id} has no classifier for {}", raw.kind)))?;
        classify(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trigger_plugin::plugin_test_util::FakeProvider;

    #[test]
    fn defaults_cover_gmail_and_drive() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(registry.provider_ids(), vec!["drive".to_string(), "gmail".to_string()]);
        assert!(registry.get("slack").is_err());
    }

    #[test]
    fn classification_is_per_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider::new("fake")));

        let raw = RawChange::new("label-added", Some("7".into()), json!({"id": "m1"}));
        let record = registry.classify("fake", &raw).unwrap();
        assert_eq!(record.family, "label-added");
        assert_eq!(record.change_id, "m1");

        assert!(matches!(registry.classify("other", &raw), Err(ProviderError::Decode(_))));
        let unknown = RawChange::new("reaction-added", None, json!({}));
        assert!(registry.classify("fake", &unknown).is_err());
    }
}
