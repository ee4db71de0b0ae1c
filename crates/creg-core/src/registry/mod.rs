//! Plugin-based factory registry
//!
//! Backends and event sources are registered by name at startup, so the
//! daemon never hardcodes which registries or runtimes exist.
//!
//! ## Registration
//!
//! Adapter crates expose a `register` function:
//!
//! ```rust,ignore
//! // In creg-backend-consul
//! pub fn register(registry: &PluginRegistry) {
//!     registry.register_backend("consul", Box::new(ConsulFactory));
//! }
//! ```
//!
//! The daemon then creates instances from configuration:
//!
//! ```rust,ignore
//! let registry = PluginRegistry::new();
//! creg_backend_consul::register(&registry);
//!
//! for backend in &config.backends {
//!     let backend = registry.create_backend(backend, &config)?;
//! }
//! ```

use crate::config::{BackendConfig, CregConfig, SourceConfig};
use crate::driver::DebugBackend;
use crate::error::{Error, Result};
use crate::labels::Eligibility;
use crate::traits::{Backend, BackendFactory, EventSource, EventSourceFactory};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Registry of backend and event source factories
///
/// Uses interior mutability so adapter crates can register through a shared
/// reference.
#[derive(Default)]
pub struct PluginRegistry {
    backends: RwLock<HashMap<String, Box<dyn BackendFactory>>>,
    sources: RwLock<HashMap<String, Box<dyn EventSourceFactory>>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `debug` backend
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_backend("debug", Box::new(DebugFactory));
        registry
    }

    /// Register a backend factory under a type name (e.g. "consul")
    pub fn register_backend(&self, name: impl Into<String>, factory: Box<dyn BackendFactory>) {
        let mut backends = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        backends.insert(name.into(), factory);
    }

    /// Register an event source factory under a type name (e.g. "docker")
    pub fn register_source(&self, name: impl Into<String>, factory: Box<dyn EventSourceFactory>) {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        sources.insert(name.into(), factory);
    }

    /// Create a backend from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn Backend>)`: Created backend
    /// - `Err(Error)`: Type not registered, or the factory rejected the config
    pub fn create_backend(
        &self,
        config: &BackendConfig,
        global: &CregConfig,
    ) -> Result<Box<dyn Backend>> {
        let backend_type = config.type_name();
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);

        let factory = backends
            .get(backend_type)
            .ok_or_else(|| Error::config(format!("Unknown backend type: {}", backend_type)))?;

        factory.create(config, global)
    }

    /// Create an event source from configuration
    pub fn create_source(
        &self,
        config: &SourceConfig,
        eligibility: &Eligibility,
    ) -> Result<Box<dyn EventSource>> {
        let source_type = config.type_name();
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);

        let factory = sources
            .get(source_type)
            .ok_or_else(|| Error::config(format!("Unknown source type: {}", source_type)))?;

        factory.create(config, eligibility)
    }

    /// Registered backend type names, sorted
    pub fn list_backends(&self) -> Vec<String> {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered source type names, sorted
    pub fn list_sources(&self) -> Vec<String> {
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = sources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend type is registered
    pub fn has_backend(&self, name: &str) -> bool {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends.contains_key(name)
    }

    /// Check if a source type is registered
    pub fn has_source(&self, name: &str) -> bool {
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        sources.contains_key(name)
    }
}

struct DebugFactory;

impl BackendFactory for DebugFactory {
    fn create(&self, config: &BackendConfig, global: &CregConfig) -> Result<Box<dyn Backend>> {
        match config {
            BackendConfig::Debug { .. } => Ok(Box::new(DebugBackend::new(
                config.name(),
                global.labels.clone(),
            ))),
            other => Err(Error::config(format!(
                "debug factory cannot build a {} backend",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_include_debug() {
        let registry = PluginRegistry::with_builtins();

        assert!(registry.has_backend("debug"));
        assert!(!registry.has_backend("consul"));
        assert_eq!(registry.list_backends(), vec!["debug".to_string()]);
        assert!(registry.list_sources().is_empty());
    }

    #[test]
    fn creates_named_debug_backend() {
        let registry = PluginRegistry::with_builtins();
        let global = CregConfig::new("node1", "10.0.0.5");
        let config = BackendConfig::Debug {
            name: Some("trace".to_string()),
        };

        let backend = registry.create_backend(&config, &global).unwrap();
        assert_eq!(backend.name(), "trace");
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        let registry = PluginRegistry::new();
        let global = CregConfig::new("node1", "10.0.0.5");
        let config = BackendConfig::Debug { name: None };

        let err = registry.create_backend(&config, &global).err().unwrap();
        assert!(err.to_string().contains("Unknown backend type: debug"));
    }
}
