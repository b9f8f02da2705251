//! Plugin Manager
//!
//! Binds the [`PluginLoader`] to the host's tool registry: every loaded
//! plugin is registered as a tool, every unloaded one is removed again.
//! During a hot-reload the old generation is unregistered before the new one
//! is registered.

use super::{
    Discovery, LoadOutcome, PluginError, PluginEvent, PluginInstance, PluginLoader,
    PluginMetadata, PluginObserver,
};
use crate::config::PluginSettings;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// Host-side registry of plugin-provided tools
pub trait ToolRegistry: Send + Sync {
    fn register_plugin_tool(&self, instance: Arc<PluginInstance>);

    fn unregister_plugin_tool(&self, key: &str);
}

/// Tool registry keeping instances in memory, keyed by plugin key
#[derive(Debug, Default)]
pub struct InMemoryToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<PluginInstance>>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<PluginInstance>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Registered keys in order
    pub fn keys(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ToolRegistry for InMemoryToolRegistry {
    fn register_plugin_tool(&self, instance: Arc<PluginInstance>) {
        let key = instance.key().to_string();
        let previous = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), instance);
        if previous.is_some() {
            debug!("Tool '{}' replaced an existing registration", key);
        }
    }

    fn unregister_plugin_tool(&self, key: &str) {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Forwards loader events to a tool registry
///
/// Several paths may report the same key. The registered tool for a key is
/// always the instance loaded from the first such path, the same one
/// [`PluginLoader::get_plugin`] returns; when it goes away the next path's
/// instance takes its place.
struct ToolBinding {
    tools: Arc<dyn ToolRegistry>,
    loaded: Mutex<BTreeMap<String, BTreeMap<PathBuf, Arc<PluginInstance>>>>,
}

impl ToolBinding {
    fn new(tools: Arc<dyn ToolRegistry>) -> Self {
        Self {
            tools,
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    fn plugin_loaded(&self, metadata: &PluginMetadata, instance: &Arc<PluginInstance>) {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        let by_path = loaded.entry(metadata.key.clone()).or_default();
        by_path.insert(metadata.path.clone(), instance.clone());

        match by_path.values().next() {
            Some(first) if Arc::ptr_eq(first, instance) => {
                debug!("Registering tool '{}'", metadata.key);
                self.tools.register_plugin_tool(instance.clone());
            }
            _ => debug!(
                "Tool '{}' from {} is shadowed by an earlier path",
                metadata.key,
                metadata.file_name()
            ),
        }
    }

    fn plugin_unloaded(&self, metadata: &PluginMetadata) {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(by_path) = loaded.get_mut(&metadata.key) else {
            self.tools.unregister_plugin_tool(&metadata.key);
            return;
        };

        let was_registered = by_path.keys().next() == Some(&metadata.path);
        by_path.remove(&metadata.path);
        if !was_registered {
            return;
        }

        match by_path.values().next() {
            Some(next) => {
                debug!("Tool '{}' now served by {}", metadata.key, next.name());
                self.tools.register_plugin_tool(next.clone());
            }
            None => {
                debug!("Unregistering tool '{}'", metadata.key);
                self.tools.unregister_plugin_tool(&metadata.key);
                loaded.remove(&metadata.key);
            }
        }
    }
}

impl PluginObserver for ToolBinding {
    fn on_event(&self, event: &PluginEvent) {
        match event {
            PluginEvent::Loaded { metadata, instance } => self.plugin_loaded(metadata, instance),
            PluginEvent::Unloaded { metadata } => self.plugin_unloaded(metadata),
            PluginEvent::StatusChanged { .. } => {}
        }
    }
}

/// Loader plus tool-registry binding
pub struct PluginManager {
    loader: Arc<PluginLoader>,
    settings: PluginSettings,
}

impl PluginManager {
    /// Create a manager with a native-library loader
    pub fn new(settings: PluginSettings, tools: Arc<dyn ToolRegistry>) -> Self {
        let loader = Arc::new(PluginLoader::new(&settings));
        Self::with_loader(settings, loader, tools)
    }

    /// Create a manager around an existing loader
    pub fn with_loader(
        settings: PluginSettings,
        loader: Arc<PluginLoader>,
        tools: Arc<dyn ToolRegistry>,
    ) -> Self {
        loader.add_observer(Arc::new(ToolBinding::new(tools)));
        Self { loader, settings }
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    /// Candidate modules in the configured plugin directory
    pub fn discover(&self) -> Discovery {
        self.loader.discover(&self.settings.plugin_dir)
    }

    /// Load or reload every discovered module, one at a time
    pub async fn load_all(&self) -> Vec<(PathBuf, Result<LoadOutcome, PluginError>)> {
        let mut results = Vec::new();
        for path in &self.discover() {
            let result = self.loader.load_or_reload(&path).await;
            results.push((path, result));
        }

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(
            "Plugin loading complete: {} loaded, {} failed",
            results.len() - failed,
            failed
        );
        results
    }

    pub async fn load_or_reload(&self, path: impl AsRef<Path>) -> Result<LoadOutcome, PluginError> {
        self.loader.load_or_reload(path).await
    }

    pub async fn unload(&self, path: impl AsRef<Path>) -> bool {
        self.loader.unload(path).await
    }

    pub async fn get_plugin(&self, key: &str) -> Option<Arc<PluginInstance>> {
        self.loader.get_plugin(key).await
    }

    pub async fn loaded_plugins(&self) -> Vec<PluginMetadata> {
        self.loader.loaded_plugins().await
    }

    /// Unload every plugin
    pub async fn shutdown(&self) -> usize {
        info!("Shutting down plugin manager");
        self.loader.unload_all().await
    }
}
