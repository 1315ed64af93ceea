//! Plugin units, manifests, and the typed implementation registry
//!
//! Plugins are compiled into the binary and exposed through a factory
//! registry; a `plugin.toml` manifest on disk activates one by name and
//! declares its dependencies, priority, and timeout. Nothing is loaded
//! reflectively.

use crate::error::{Error, Result};
use crate::events::{Event, EventBus, SharedState};
use crate::storage::RecordStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

mod discovery;
mod engine;
mod recorder;
mod resolver;

pub use discovery::{discover_plugins, DiscoveredPlugin};
pub use engine::{EnginePolicy, PluginEngine, PluginHealth, PluginMetrics};
pub use recorder::{recorder_manifest, RecorderPlugin, RECORDER_PLUGIN_NAME};
pub use resolver::resolve_order;

/// Contract every plugin unit implements.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Called once before any event is dispatched, in dependency order.
    async fn initialize(&self, context: &PluginContext) -> Result<()>;

    /// Called for every event delivered to the engine.
    async fn on_event(&self, event: &Event, context: &PluginContext) -> Result<()>;

    /// Called once during engine shutdown.
    async fn shutdown(&self) -> Result<()>;
}

/// Execution context supplied by the engine to every plugin call.
#[derive(Clone)]
pub struct PluginContext {
    pub bus: Arc<EventBus>,
    pub store: Arc<dyn RecordStore>,
    pub config: Arc<crate::config::WiretapConfig>,
    /// Key/value state shared across plugins and dispatches.
    pub shared_state: Arc<RwLock<SharedState>>,
}

impl PluginContext {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<dyn RecordStore>,
        config: Arc<crate::config::WiretapConfig>,
    ) -> Self {
        Self {
            bus,
            store,
            config,
            shared_state: Arc::new(RwLock::new(SharedState::new())),
        }
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Manifest describing one plugin activation, loaded from `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl PluginManifest {
    /// Minimal manifest with defaults for everything but name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies: Vec::new(),
            priority: 0,
            timeout_ms: default_timeout_ms(),
            capabilities: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidManifest("name must not be empty".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(Error::InvalidManifest(format!(
                "plugin {} has an empty version",
                self.name
            )));
        }
        if self.timeout_ms == 0 {
            return Err(Error::InvalidManifest(format!(
                "plugin {} has a zero timeout",
                self.name
            )));
        }
        Ok(())
    }
}

/// Factory producing a plugin instance for one registered implementation.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Typed registry of known plugin implementations, keyed by name.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: PluginFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::PluginAlreadyExists(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Instantiate the implementation registered under `name`.
    pub fn bind(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_validation_rejects_missing_fields() {
        assert!(PluginManifest::new("recorder", "1.0.0").validate().is_ok());
        assert!(PluginManifest::new("", "1.0.0").validate().is_err());
        assert!(PluginManifest::new("recorder", " ").validate().is_err());

        let mut zero_timeout = PluginManifest::new("recorder", "1.0.0");
        zero_timeout.timeout_ms = 0;
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn manifest_defaults_apply_when_fields_are_omitted() {
        let manifest: PluginManifest = toml::from_str(
            r#"
            name = "tracer"
            version = "0.3.0"
            "#,
        )
        .unwrap();
        assert_eq!(manifest.priority, 0);
        assert_eq!(manifest.timeout_ms, 5000);
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = PluginRegistry::new();
        let factory: PluginFactory = Arc::new(|| {
            unreachable!("factory is never invoked in this test")
        });
        registry.register("recorder", factory.clone()).unwrap();
        assert!(matches!(
            registry.register("recorder", factory),
            Err(Error::PluginAlreadyExists(_))
        ));
        assert!(registry.contains("recorder"));
        assert!(registry.bind("unknown").is_none());
    }
}
