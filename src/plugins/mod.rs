use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub mod dependency;
pub mod loader;
pub mod manifest;
pub mod watcher;

pub use dependency::PluginDependencyManager;
pub use loader::{PluginFactoryRegistry, PluginInfo, PluginLoader, PluginState};
pub use manifest::{InputType, PluginInput, PluginManifest};

use crate::intelligence::roles::AssistantRole;

/// Contract for a loadable plugin.
///
/// Instances are built by a [`PluginFactoryRegistry`] constructor named by
/// the manifest's `class`. Hooks are matched by name; a plugin only receives
/// `call_hook` for names it returned from `hooks`.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Teardown before the instance is dropped on unload or reload
    async fn unload(&self) -> Result<()> {
        Ok(())
    }

    fn hooks(&self) -> Vec<String> {
        Vec::new()
    }

    async fn call_hook(&self, hook: &str, _args: &Value) -> Result<Value> {
        anyhow::bail!("hook {} not implemented", hook)
    }

    /// Handle a request with inputs already validated against the manifest
    async fn process(&self, request: &str, inputs: &Map<String, Value>) -> Result<Value>;

    fn supported_roles(&self) -> Vec<AssistantRole> {
        Vec::new()
    }

    /// 1 (lowest) to 10
    fn priority(&self) -> u8 {
        5
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Circular dependency detected involving {0}")]
    CircularDependency(String),

    #[error("Invalid JSON in manifest {path}: {message}")]
    ManifestParse { path: String, message: String },

    #[error("Invalid manifest format: {0}")]
    ManifestInvalid(String),

    #[error("No plugin class registered as {0}")]
    UnknownClass(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Plugin {name} failed to initialize: {message}")]
    Initialization { name: String, message: String },
}
