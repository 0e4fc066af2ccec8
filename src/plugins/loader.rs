use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;

use super::{Plugin, PluginDependencyManager, PluginError, PluginManifest};
use crate::Status;

pub const MANIFEST_FILE: &str = "manifest.json";

type PluginConstructor = Arc<dyn Fn(&PluginManifest) -> Result<Arc<dyn Plugin>> + Send + Sync>;

/// Maps a manifest `class` to the constructor that builds it
#[derive(Clone, Default)]
pub struct PluginFactoryRegistry {
    constructors: HashMap<String, PluginConstructor>,
}

impl PluginFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, class_name: impl Into<String>, constructor: F)
    where
        F: Fn(&PluginManifest) -> Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(class_name.into(), Arc::new(constructor));
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    fn construct(&self, manifest: &PluginManifest) -> Result<Arc<dyn Plugin>, PluginError> {
        let constructor = self
            .constructors
            .get(&manifest.class_name)
            .ok_or_else(|| PluginError::UnknownClass(manifest.class_name.clone()))?;
        constructor(manifest).map_err(|e| PluginError::Initialization {
            name: manifest.name.clone(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Loaded,
    Unloaded,
    Reloading,
    Failed,
}

struct PluginSlot {
    manifest: PluginManifest,
    path: PathBuf,
    state: PluginState,
    instance: Option<Arc<dyn Plugin>>,
    hooks: Vec<String>,
    generation: u64,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub default_prompt: String,
    pub class_name: String,
    pub dependencies: Vec<String>,
    pub state: PluginState,
    pub generation: u64,
    pub hooks: Vec<String>,
    pub path: PathBuf,
    pub last_error: Option<String>,
}

impl PluginSlot {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            description: self.manifest.description.clone(),
            default_prompt: self.manifest.default_prompt.clone(),
            class_name: self.manifest.class_name.clone(),
            dependencies: self.manifest.dependencies.clone(),
            state: self.state,
            generation: self.generation,
            hooks: self.hooks.clone(),
            path: self.path.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookResult {
    pub plugin: String,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginResponse {
    pub status: Status,
    pub plugin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PluginResponse {
    fn error(plugin: &str, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            plugin: plugin.to_string(),
            result: None,
            message: Some(message.into()),
        }
    }

    /// Human-readable text of the result, if the plugin produced one
    pub fn text(&self) -> Option<String> {
        let result = self.result.as_ref()?;
        if let Value::String(s) = result {
            return Some(s.clone());
        }
        ["response", "text", "message", "result"]
            .iter()
            .find_map(|key| result.get(key).and_then(Value::as_str))
            .map(str::to_string)
    }
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, PluginSlot>,
    dependencies: PluginDependencyManager,
    load_order: Vec<String>,
}

/// Discovers plugin directories, loads them in dependency order and
/// dispatches hooks and requests to the loaded instances.
///
/// All plugin state sits behind one async lock. Callers get `Arc` handles
/// to instances, so a plugin being reloaded never pulls the instance out
/// from under a call already in flight.
pub struct PluginLoader {
    directory: PathBuf,
    factories: PluginFactoryRegistry,
    registry: RwLock<Registry>,
}

impl PluginLoader {
    pub fn new(directory: impl Into<PathBuf>, factories: PluginFactoryRegistry) -> Self {
        Self {
            directory: directory.into(),
            factories,
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Discover and load every plugin. A circular dependency aborts loading
    /// altogether; individual plugin failures only mark that plugin failed.
    pub async fn initialize(&self) -> Result<Vec<String>, PluginError> {
        let discovered = self.discover().await;

        let load_order = {
            let mut registry = self.registry.write().await;
            for (plugin, missing) in registry.dependencies.missing_dependencies() {
                tracing::warn!("Plugin {} depends on unknown plugin {}", plugin, missing);
            }
            match registry.dependencies.resolve_dependencies() {
                Ok(order) => {
                    registry.load_order = order.clone();
                    order
                }
                Err(e) => {
                    tracing::error!("Error resolving plugin dependencies: {}", e);
                    return Err(e);
                }
            }
        };
        tracing::info!("Plugin load order: {}", load_order.join(", "));

        let mut loaded = Vec::new();
        for name in &load_order {
            if let Some(dependency) = self.unavailable_dependency(name).await {
                let message = format!("dependency {} is not loaded", dependency);
                tracing::error!("Skipping plugin {}: {}", name, message);
                self.mark_failed(name, message).await;
                continue;
            }
            if self.load_plugin(name).await.is_ok() {
                loaded.push(name.clone());
            }
        }

        tracing::info!(
            "Plugin loader initialized: {} discovered, {} loaded",
            discovered.len(),
            loaded.len()
        );
        Ok(loaded)
    }

    /// Scan the plugin directory for sub-directories with a manifest.
    /// Returns the names of newly discovered plugins.
    pub async fn discover(&self) -> Vec<String> {
        let entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    "Plugin directory not found: {} ({})",
                    self.directory.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut dirs = Vec::new();
        let mut stream = ReadDirStream::new(entries);
        while let Some(entry) = stream.next().await {
            match entry {
                Ok(entry) if entry.path().is_dir() => dirs.push(entry.path()),
                Ok(_) => {}
                Err(e) => tracing::warn!("Error reading plugin directory: {}", e),
            }
        }
        dirs.sort();

        let mut discovered = Vec::new();
        for dir in dirs {
            let manifest_path = dir.join(MANIFEST_FILE);
            if !manifest_path.exists() {
                tracing::warn!("No {} found in plugin folder: {}", MANIFEST_FILE, dir.display());
                continue;
            }

            let manifest = match read_manifest(&manifest_path).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::error!("Error loading plugin {}: {}", dir.display(), e);
                    continue;
                }
            };

            let mut registry = self.registry.write().await;
            if registry.slots.contains_key(&manifest.name) {
                tracing::warn!(
                    "Duplicate plugin name {} in {}, skipping",
                    manifest.name,
                    dir.display()
                );
                continue;
            }

            tracing::info!("Discovered plugin: {} v{}", manifest.name, manifest.version);
            registry
                .dependencies
                .add_plugin(manifest.name.clone(), manifest.dependencies.clone());
            discovered.push(manifest.name.clone());
            registry.slots.insert(
                manifest.name.clone(),
                PluginSlot {
                    manifest,
                    path: dir,
                    state: PluginState::Discovered,
                    instance: None,
                    hooks: Vec::new(),
                    generation: 0,
                    last_error: None,
                },
            );
        }

        discovered
    }

    async fn unavailable_dependency(&self, name: &str) -> Option<String> {
        let registry = self.registry.read().await;
        let slot = registry.slots.get(name)?;
        slot.manifest
            .dependencies
            .iter()
            .find(|dep| {
                registry
                    .slots
                    .get(dep.as_str())
                    .is_some_and(|d| d.state != PluginState::Loaded)
            })
            .cloned()
    }

    async fn mark_failed(&self, name: &str, message: String) {
        let mut registry = self.registry.write().await;
        if let Some(slot) = registry.slots.get_mut(name) {
            slot.state = PluginState::Failed;
            slot.last_error = Some(message);
        }
    }

    /// Construct, initialize and register hooks for one discovered plugin.
    /// Loading an already loaded plugin is a no-op.
    pub async fn load_plugin(&self, name: &str) -> Result<(), PluginError> {
        let manifest = {
            let registry = self.registry.read().await;
            let slot = registry
                .slots
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            if slot.state == PluginState::Loaded {
                return Ok(());
            }
            slot.manifest.clone()
        };

        let instance = match self.factories.construct(&manifest) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::error!("Error loading plugin {}: {}", name, e);
                self.mark_failed(name, e.to_string()).await;
                return Err(e);
            }
        };

        if let Err(e) = instance.initialize().await {
            let error = PluginError::Initialization {
                name: name.to_string(),
                message: e.to_string(),
            };
            tracing::error!("Error loading plugin {}: {}", name, error);
            self.mark_failed(name, error.to_string()).await;
            return Err(error);
        }

        let hooks = instance.hooks();
        let mut registry = self.registry.write().await;
        let slot = registry
            .slots
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if !hooks.is_empty() {
            tracing::info!("Registered {} hooks for plugin {}", hooks.len(), name);
        }
        slot.instance = Some(instance);
        slot.hooks = hooks;
        slot.state = PluginState::Loaded;
        slot.generation += 1;
        slot.last_error = None;

        tracing::info!("Loaded plugin: {} (generation {})", name, slot.generation);
        Ok(())
    }

    /// Drop hooks and instance, awaiting the plugin's teardown
    pub async fn unload_plugin(&self, name: &str) -> Result<(), PluginError> {
        let instance = {
            let mut registry = self.registry.write().await;
            let slot = registry
                .slots
                .get_mut(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            slot.hooks.clear();
            if slot.state == PluginState::Loaded {
                slot.state = PluginState::Unloaded;
            }
            slot.instance.take()
        };

        if let Some(instance) = instance {
            if let Err(e) = instance.unload().await {
                tracing::warn!("Error unloading plugin {}: {}", name, e);
            }
            tracing::info!("Unloaded plugin: {}", name);
        }
        Ok(())
    }

    /// Unload and load the plugin again, re-reading its manifest.
    /// Plugins depending on it are left alone; use
    /// [`dependents_of`](Self::dependents_of) to reload them explicitly.
    /// A manifest whose dependencies would form a cycle fails the reload and
    /// leaves the previous dependency list in place.
    pub async fn reload_plugin(&self, name: &str) -> Result<(), PluginError> {
        let (manifest_path, previous_dependencies) = {
            let mut registry = self.registry.write().await;
            let slot = registry
                .slots
                .get_mut(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            if slot.state == PluginState::Reloading {
                tracing::debug!("Plugin {} is already reloading", name);
                return Ok(());
            }
            slot.state = PluginState::Reloading;
            (slot.path.join(MANIFEST_FILE), slot.manifest.dependencies.clone())
        };

        self.unload_plugin(name).await?;

        match read_manifest(&manifest_path).await {
            Ok(manifest) if manifest.name == name => {
                let mut registry = self.registry.write().await;
                registry
                    .dependencies
                    .add_plugin(name.to_string(), manifest.dependencies.clone());
                match registry.dependencies.resolve_dependencies() {
                    Ok(order) => registry.load_order = order,
                    Err(e) => {
                        tracing::error!("Error reloading plugin {}: {}", name, e);
                        registry
                            .dependencies
                            .add_plugin(name.to_string(), previous_dependencies);
                        if let Some(slot) = registry.slots.get_mut(name) {
                            slot.state = PluginState::Failed;
                            slot.last_error = Some(e.to_string());
                        }
                        return Err(e);
                    }
                }
                for dependency in &manifest.dependencies {
                    if !registry.dependencies.contains(dependency) {
                        tracing::warn!("Plugin {} depends on unknown plugin {}", name, dependency);
                    }
                }
                if let Some(slot) = registry.slots.get_mut(name) {
                    slot.manifest = manifest;
                }
            }
            Ok(manifest) => {
                tracing::warn!(
                    "Manifest of {} now names {}, keeping the old manifest",
                    name,
                    manifest.name
                );
            }
            Err(e) => {
                tracing::error!("Error reloading plugin {}: {}", name, e);
                self.mark_failed(name, e.to_string()).await;
                return Err(e);
            }
        }

        self.load_plugin(name).await?;
        tracing::info!("Reloaded plugin: {}", name);
        Ok(())
    }

    /// Call `hook` on every loaded plugin exposing it, in load order.
    /// Failing hooks are logged and left out of the results.
    pub async fn invoke_hook(&self, hook: &str, args: &Value) -> Vec<HookResult> {
        let targets: Vec<(String, Arc<dyn Plugin>)> = {
            let registry = self.registry.read().await;
            ordered_names(&registry)
                .into_iter()
                .filter_map(|name| {
                    let slot = registry.slots.get(&name)?;
                    if !slot.hooks.iter().any(|h| h == hook) {
                        return None;
                    }
                    slot.instance.clone().map(|instance| (name, instance))
                })
                .collect()
        };

        let mut results = Vec::with_capacity(targets.len());
        for (plugin, instance) in targets {
            match instance.call_hook(hook, args).await {
                Ok(result) => results.push(HookResult { plugin, result }),
                Err(e) => tracing::error!("Error invoking hook {} on plugin {}: {}", hook, plugin, e),
            }
        }
        results
    }

    /// Validate `inputs` against the manifest and run the plugin's `process`
    pub async fn execute_plugin(
        &self,
        name: &str,
        request: &str,
        inputs: &Map<String, Value>,
    ) -> PluginResponse {
        let (manifest, instance) = {
            let registry = self.registry.read().await;
            match registry.slots.get(name) {
                None => return PluginResponse::error(name, PluginError::NotFound(name.to_string()).to_string()),
                Some(slot) => match &slot.instance {
                    Some(instance) if slot.state == PluginState::Loaded => {
                        (slot.manifest.clone(), instance.clone())
                    }
                    _ => {
                        return PluginResponse::error(name, format!("Plugin {} is not loaded", name))
                    }
                },
            }
        };

        let validated = match manifest.validate_input(inputs) {
            Ok(validated) => validated,
            Err(e) => return PluginResponse::error(name, format!("Invalid plugin inputs: {}", e)),
        };

        match instance.process(request, &validated).await {
            Ok(result) => PluginResponse {
                status: Status::Success,
                plugin: name.to_string(),
                result: Some(result),
                message: None,
            },
            Err(e) => {
                tracing::error!("Error executing plugin {}: {}", name, e);
                PluginResponse::error(name, format!("Error executing plugin: {}", e))
            }
        }
    }

    pub async fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let registry = self.registry.read().await;
        registry
            .slots
            .get(name)
            .filter(|slot| slot.state == PluginState::Loaded)
            .and_then(|slot| slot.instance.clone())
    }

    /// Loaded instances in load order
    pub async fn loaded_plugins(&self) -> Vec<(String, Arc<dyn Plugin>)> {
        let registry = self.registry.read().await;
        ordered_names(&registry)
            .into_iter()
            .filter_map(|name| {
                let instance = registry.slots.get(&name)?.instance.clone()?;
                Some((name, instance))
            })
            .collect()
    }

    pub async fn plugin_info(&self, name: &str) -> Option<PluginInfo> {
        self.registry.read().await.slots.get(name).map(PluginSlot::info)
    }

    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        let registry = self.registry.read().await;
        ordered_names(&registry)
            .iter()
            .filter_map(|name| registry.slots.get(name).map(PluginSlot::info))
            .collect()
    }

    pub async fn dependents_of(&self, name: &str) -> Vec<String> {
        self.registry.read().await.dependencies.dependents_of(name)
    }

    /// `(plugin name, plugin directory)` for every known plugin
    pub async fn plugin_dirs(&self) -> Vec<(String, PathBuf)> {
        let registry = self.registry.read().await;
        ordered_names(&registry)
            .into_iter()
            .filter_map(|name| {
                let path = registry.slots.get(&name)?.path.clone();
                Some((name, path))
            })
            .collect()
    }

    /// Unload everything, dependents before their dependencies
    pub async fn shutdown(&self) {
        let names = {
            let registry = self.registry.read().await;
            ordered_names(&registry)
        };
        for name in names.iter().rev() {
            if let Err(e) = self.unload_plugin(name).await {
                tracing::warn!("Error unloading plugin {}: {}", name, e);
            }
        }
    }
}

/// Load order first, then anything not in it (e.g. discovered after a
/// failed resolution) by name
fn ordered_names(registry: &Registry) -> Vec<String> {
    let mut names = registry.load_order.clone();
    let mut rest: Vec<String> = registry
        .slots
        .keys()
        .filter(|name| !registry.load_order.contains(name))
        .cloned()
        .collect();
    rest.sort();
    names.extend(rest);
    names
}

async fn read_manifest(path: &Path) -> Result<PluginManifest, PluginError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PluginError::ManifestParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    PluginManifest::parse_at(&content, path)
}
