//! Provider Registry
//!
//! Maps backend names to factories. The service builds its provider through a
//! registry handed to it at startup instead of a process-wide table, so tests
//! and embedders can add their own backends.
//!
//! ```ignore
//! let registry = ProviderRegistry::with_defaults();
//! let provider = registry.create(&config.storage)?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::file::FileProvider;
use crate::memory::MemoryProvider;
use crate::provider::StorageProvider;
use crate::relational::RelationalProvider;

pub type ProviderFactory =
    Box<dyn Fn(&StorageConfig) -> Result<Arc<dyn StorageProvider>> + Send + Sync>;

#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `file`, `relational` and `in-memory` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file", |config| {
            Ok(Arc::new(FileProvider::new(config.file.clone())) as Arc<dyn StorageProvider>)
        });
        registry.register("relational", |config| {
            Ok(Arc::new(RelationalProvider::new(config.relational.clone()))
                as Arc<dyn StorageProvider>)
        });
        registry.register("in-memory", |config| {
            Ok(Arc::new(MemoryProvider::new(config.memory.clone())) as Arc<dyn StorageProvider>)
        });
        registry
    }

    /// Add or replace a factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&StorageConfig) -> Result<Arc<dyn StorageProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the provider selected by `config.type`.
    pub fn create(&self, config: &StorageConfig) -> Result<Arc<dyn StorageProvider>> {
        self.create_named(config.storage_type.as_str(), config)
    }

    pub fn create_named(
        &self,
        name: &str,
        config: &StorageConfig,
    ) -> Result<Arc<dyn StorageProvider>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StorageError::UnknownStorageType(name.to_string()))?;
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageType;

    #[test]
    fn test_defaults_cover_all_storage_types() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["file", "in-memory", "relational"]);

        for storage_type in [StorageType::File, StorageType::Relational, StorageType::InMemory] {
            let config = StorageConfig {
                storage_type,
                ..Default::default()
            };
            let provider = registry.create(&config).unwrap();
            assert_eq!(provider.name(), storage_type.as_str());
        }
    }

    #[test]
    fn test_unknown_name() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.create(&StorageConfig::default()),
            Err(StorageError::UnknownStorageType(_))
        ));
    }

    #[test]
    fn test_custom_factory() {
        let mut registry = ProviderRegistry::new();
        registry.register("scratch", |_| {
            Ok(Arc::new(MemoryProvider::default()) as Arc<dyn StorageProvider>)
        });
        let provider = registry
            .create_named("scratch", &StorageConfig::default())
            .unwrap();
        assert_eq!(provider.name(), "in-memory");
    }
}
