//! Dynamic Plugin Loader
//!
//! The loader owns the registry of loaded plugins and performs every
//! structural operation on it: fresh load, hot-reload and unload. Structural
//! operations are serialized through one gate shared by all paths; read-only
//! queries take the registry lock only and may run concurrently.
//!
//! A registry entry exists only while its isolation unit is live. Entries are
//! inserted after the plugin's load hook succeeded and removed before the unit
//! is torn down, so a partially loaded or half-unloaded plugin is never
//! visible to readers.

use super::discovery::{Discovery, NameExclusions};
use super::isolation::{IsolationUnit, ModuleImage, NativeUnitFactory, UnitFactory};
use super::{
    panic_message, LoadOutcome, Plugin, PluginError, PluginEvent, PluginInstance, PluginMetadata,
    PluginObserver, PluginStatus,
};
use crate::config::PluginSettings;
use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// Capacity of the outbound event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bounded wait for a torn-down unit to release its resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Liveness checks before the unit is declared unloaded regardless
    pub attempts: u32,
    /// Delay between checks
    pub interval: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(50),
        }
    }
}

/// Structural operations currently inside the gate, and the most ever seen
#[derive(Debug, Default)]
struct GateOccupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Held for the duration of one structural operation
struct GateGuard<'a> {
    occupancy: &'a GateOccupancy,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> GateGuard<'a> {
    fn new(lock: MutexGuard<'a, ()>, occupancy: &'a GateOccupancy) -> Self {
        let now = occupancy.current.fetch_add(1, Ordering::SeqCst) + 1;
        occupancy.peak.fetch_max(now, Ordering::SeqCst);
        Self {
            occupancy,
            _lock: lock,
        }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        // Runs before the lock field is released
        self.occupancy.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One loaded module: its unit, the live instance and its metadata
///
/// The instance is declared first so it drops before the unit releases the
/// code it points into.
struct LoadedPlugin {
    instance: Arc<PluginInstance>,
    unit: Box<dyn IsolationUnit>,
    metadata: PluginMetadata,
}

/// Plugin loader and registry
pub struct PluginLoader {
    /// Serializes load, reload and unload across all paths
    gate: Mutex<()>,
    occupancy: GateOccupancy,
    /// Loaded plugins keyed by normalized path
    registry: RwLock<BTreeMap<PathBuf, LoadedPlugin>>,
    units: Arc<dyn UnitFactory>,
    observers: std::sync::RwLock<Vec<Arc<dyn PluginObserver>>>,
    events: broadcast::Sender<PluginEvent>,
    drain: DrainPolicy,
    module_extension: String,
    discovery_exclusions: NameExclusions,
    debug_symbol_extension: String,
}

impl PluginLoader {
    /// Create a loader that opens native dynamic libraries
    pub fn new(settings: &PluginSettings) -> Self {
        let units = Arc::new(NativeUnitFactory::new(settings.shared_exclusions()));
        Self::with_unit_factory(settings, units)
    }

    /// Create a loader with a custom isolation unit factory
    pub fn with_unit_factory(settings: &PluginSettings, units: Arc<dyn UnitFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            gate: Mutex::new(()),
            occupancy: GateOccupancy::default(),
            registry: RwLock::new(BTreeMap::new()),
            units,
            observers: std::sync::RwLock::new(Vec::new()),
            events,
            drain: settings.drain_policy(),
            module_extension: settings.module_extension.clone(),
            discovery_exclusions: settings.discovery_exclusions(),
            debug_symbol_extension: settings.debug_symbol_extension.clone(),
        }
    }

    /// Register an observer called synchronously for every event
    pub fn add_observer(&self, observer: Arc<dyn PluginObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Subscribe to the outbound event channel
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    /// Candidate modules under `directory`
    pub fn discover(&self, directory: impl AsRef<Path>) -> Discovery {
        Discovery::new(
            directory.as_ref(),
            &self.module_extension,
            self.discovery_exclusions.clone(),
        )
    }

    /// Load the module at `path`, or hot-reload it if its contents changed
    ///
    /// Unchanged modules are left alone and reported with
    /// `was_reloaded == false`. Every failure, including a panic inside plugin
    /// code, is returned as an error; the registry is never left holding a
    /// partially loaded plugin.
    pub async fn load_or_reload(&self, path: impl AsRef<Path>) -> Result<LoadOutcome, PluginError> {
        let path = path.as_ref();
        let result = AssertUnwindSafe(self.load_or_reload_inner(path))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(PluginError::Internal(panic_message(payload.as_ref()))));

        if let Err(e) = &result {
            error!("Failed to load plugin {:?}: {}", path, e);
            self.emit(PluginEvent::StatusChanged {
                path: lenient_normalize(path).await,
                metadata: None,
                status: PluginStatus::Error,
                message: e.to_string(),
            });
        }
        result
    }

    /// Unload the module at `path`. Returns false if it was not loaded.
    pub async fn unload(&self, path: impl AsRef<Path>) -> bool {
        let path = lenient_normalize(path.as_ref()).await;
        let result = AssertUnwindSafe(async {
            let _gate = self.enter_gate().await;
            self.retire_entry(&path).await
        })
        .catch_unwind()
        .await;

        match result {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!("Unload requested for {:?}, which is not loaded", path);
                false
            }
            Err(payload) => {
                error!(
                    "Unexpected failure unloading {:?}: {}",
                    path,
                    panic_message(payload.as_ref())
                );
                false
            }
        }
    }

    /// Unload every loaded plugin, returning how many were unloaded
    pub async fn unload_all(&self) -> usize {
        let paths: Vec<PathBuf> = self.registry.read().await.keys().cloned().collect();
        let mut unloaded = 0;
        for path in paths {
            if self.unload(&path).await {
                unloaded += 1;
            }
        }
        info!("Unloaded {} plugin(s)", unloaded);
        unloaded
    }

    /// Highest number of structural operations ever observed inside the gate
    /// at the same time. Anything above 1 means the gate was bypassed.
    pub fn peak_gate_occupancy(&self) -> usize {
        self.occupancy.peak.load(Ordering::SeqCst)
    }

    async fn enter_gate(&self) -> GateGuard<'_> {
        GateGuard::new(self.gate.lock().await, &self.occupancy)
    }

    /// First loaded plugin whose key matches, in path order
    pub async fn get_plugin(&self, key: &str) -> Option<Arc<PluginInstance>> {
        self.registry
            .read()
            .await
            .values()
            .find(|entry| entry.metadata.key == key)
            .map(|entry| entry.instance.clone())
    }

    /// Metadata of every loaded plugin, in path order
    pub async fn loaded_plugins(&self) -> Vec<PluginMetadata> {
        self.registry
            .read()
            .await
            .values()
            .map(|entry| entry.metadata.clone())
            .collect()
    }

    /// Metadata of the plugin loaded from `path`, if any
    pub async fn metadata(&self, path: impl AsRef<Path>) -> Option<PluginMetadata> {
        let path = lenient_normalize(path.as_ref()).await;
        self.registry
            .read()
            .await
            .get(&path)
            .map(|entry| entry.metadata.clone())
    }

    pub async fn is_loaded(&self, path: impl AsRef<Path>) -> bool {
        let path = lenient_normalize(path.as_ref()).await;
        self.registry.read().await.contains_key(&path)
    }

    async fn load_or_reload_inner(&self, path: &Path) -> Result<LoadOutcome, PluginError> {
        let path = normalize_path(path).await?;
        let _gate = self.enter_gate().await;

        let image = ModuleImage::read(&path, &self.debug_symbol_extension).await?;
        let current = self
            .registry
            .read()
            .await
            .get(&path)
            .map(|entry| entry.metadata.clone());

        let was_reloaded = match current {
            Some(metadata) if metadata.hash == image.hash => {
                debug!("Plugin {} unchanged, skipping", metadata.file_name());
                return Ok(LoadOutcome {
                    metadata,
                    was_reloaded: false,
                });
            }
            Some(metadata) => {
                info!(
                    "Change detected in {}, reloading '{}'",
                    metadata.file_name(),
                    metadata.key
                );
                self.retire_entry(&path).await;
                true
            }
            None => false,
        };

        let units = self.units.clone();
        let loaded = tokio::task::spawn_blocking(move || instantiate(units.as_ref(), &image))
            .await
            .map_err(|e| match e.try_into_panic() {
                Ok(payload) => PluginError::Internal(panic_message(payload.as_ref())),
                Err(e) => PluginError::Internal(e.to_string()),
            })??;
        let metadata = loaded.metadata.clone();
        let instance = loaded.instance.clone();

        {
            let mut registry = self.registry.write().await;
            if let Some(other) = registry.values().find(|e| e.metadata.key == metadata.key) {
                warn!(
                    "Plugin key '{}' from {} is already used by {}",
                    metadata.key,
                    metadata.file_name(),
                    other.metadata.file_name()
                );
            }
            registry.insert(path.clone(), loaded);
        }

        info!(
            "{} plugin '{}' v{} from {}",
            if was_reloaded { "Reloaded" } else { "Loaded" },
            metadata.key,
            metadata.version,
            metadata.file_name()
        );

        self.emit(PluginEvent::Loaded {
            metadata: metadata.clone(),
            instance,
        });
        self.emit(PluginEvent::StatusChanged {
            path,
            metadata: Some(metadata.clone()),
            status: PluginStatus::Loaded,
            message: if was_reloaded {
                "reloaded".to_string()
            } else {
                "loaded".to_string()
            },
        });

        Ok(LoadOutcome {
            metadata,
            was_reloaded,
        })
    }

    /// Run the unload hook, remove the entry and tear its unit down.
    /// Caller must hold the gate.
    async fn retire_entry(&self, path: &Path) -> Option<PluginMetadata> {
        let instance = self
            .registry
            .read()
            .await
            .get(path)
            .map(|entry| entry.instance.clone())?;

        if let Err(message) = invoke_hook(&instance, |plugin| plugin.on_unload()) {
            let err = PluginError::UnloadHookFailed(format!("'{}': {}", instance.key(), message));
            warn!("{}", err);
        }

        let LoadedPlugin {
            mut unit,
            instance,
            mut metadata,
        } = self.registry.write().await.remove(path)?;

        teardown(unit.as_mut(), &instance);
        let drained = self.drain(unit.as_mut(), &metadata).await;
        drop(unit);

        metadata.loaded = false;
        info!("Unloaded plugin '{}' from {}", metadata.key, metadata.file_name());

        self.emit(PluginEvent::Unloaded {
            metadata: metadata.clone(),
        });
        self.emit(PluginEvent::StatusChanged {
            path: path.to_path_buf(),
            metadata: Some(metadata.clone()),
            status: PluginStatus::Unloaded,
            message: if drained {
                "unloaded".to_string()
            } else {
                format!(
                    "unloaded; unit still reported live after {} checks",
                    self.drain.attempts
                )
            },
        });

        Some(metadata)
    }

    /// Poll the unit's liveness a bounded number of times. Returns whether it
    /// reported released; the caller declares it unloaded either way.
    async fn drain(&self, unit: &mut dyn IsolationUnit, metadata: &PluginMetadata) -> bool {
        for attempt in 1..=self.drain.attempts {
            if !unit.is_alive() {
                debug!(
                    "Unit {} for '{}' released after {} check(s)",
                    unit.id(),
                    metadata.key,
                    attempt
                );
                return true;
            }
            unit.reclaim();
            tokio::time::sleep(self.drain.interval).await;
        }

        let released = !unit.is_alive();
        if !released {
            warn!(
                "Unit {} for '{}' still live after {} checks, declaring it unloaded",
                unit.id(),
                metadata.key,
                self.drain.attempts
            );
        }
        released
    }

    fn emit(&self, event: PluginEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
                warn!(
                    "Plugin event observer panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

impl Drop for PluginLoader {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        if !registry.is_empty() {
            warn!(
                "PluginLoader dropped with {} plugins still loaded",
                registry.len()
            );
            for (_, mut entry) in std::mem::take(registry) {
                if let Err(message) = invoke_hook(&entry.instance, |plugin| plugin.on_unload()) {
                    let err = PluginError::UnloadHookFailed(format!(
                        "'{}': {}",
                        entry.instance.key(),
                        message
                    ));
                    warn!("{}", err);
                }
                teardown(entry.unit.as_mut(), &entry.instance);
            }
        }
    }
}

/// Open `image` in a new unit and run the load hook. On any failure the
/// unit is torn down before returning. Runs on the blocking pool: staging,
/// opening the library and the load hook may all block.
fn instantiate(units: &dyn UnitFactory, image: &ModuleImage) -> Result<LoadedPlugin, PluginError> {
    let mut unit = units.create(&image.path);
    debug!("Created isolation unit {} for {}", unit.id(), image.file_name());

    let opened = catch_unwind(AssertUnwindSafe(|| open_module(unit.as_mut(), image)))
        .unwrap_or_else(|payload| {
            Err(PluginError::InstantiationFailed(panic_message(payload.as_ref())))
        });
    let (instance, api_version) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            unit.unload();
            return Err(e);
        }
    };

    let metadata = PluginMetadata {
        path: image.path.clone(),
        key: instance.key().to_string(),
        name: instance.name().to_string(),
        icon: instance.icon().to_string(),
        version: instance.version().to_string(),
        author: instance.author().to_string(),
        description: instance.description().to_string(),
        api_version,
        loaded_at: Utc::now(),
        loaded: true,
        hash: image.hash.clone(),
    };

    if let Err(message) = invoke_hook(&instance, |plugin| plugin.on_load()) {
        teardown(unit.as_mut(), &instance);
        return Err(PluginError::LoadHookFailed(format!(
            "'{}' from {}: {}",
            metadata.key,
            image.file_name(),
            message
        )));
    }

    Ok(LoadedPlugin {
        unit,
        instance,
        metadata,
    })
}

/// Open the module and create its first plugin implementation
fn open_module(
    unit: &mut dyn IsolationUnit,
    image: &ModuleImage,
) -> Result<(Arc<PluginInstance>, Option<String>), PluginError> {
    let exports = unit.load(image)?;
    match exports.implementations {
        0 => return Err(PluginError::NoContractImplementationFound(image.file_name())),
        1 => {}
        n => warn!(
            "{} exposes {} plugin implementations, using the first",
            image.file_name(),
            n
        ),
    }
    let plugin = unit.instantiate(0)?;
    Ok((Arc::new(PluginInstance::new(plugin)), exports.api_version))
}

/// Drop the plugin object, then release the unit's code
fn teardown(unit: &mut dyn IsolationUnit, instance: &PluginInstance) {
    drop(instance.retire());
    unit.unload();
}

/// Call a lifecycle hook, turning errors and panics into a message
fn invoke_hook(
    instance: &PluginInstance,
    hook: impl FnOnce(&mut dyn Plugin) -> super::HookResult,
) -> Result<(), String> {
    match instance.with_mut(|plugin| catch_unwind(AssertUnwindSafe(|| hook(plugin)))) {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(payload)) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
        Err(e) => Err(e.to_string()),
    }
}

/// Normalize a module path for loading: absolute, symlinks resolved, must be
/// an existing regular file
async fn normalize_path(path: &Path) -> Result<PathBuf, PluginError> {
    if path.as_os_str().is_empty() {
        return Err(PluginError::PathInvalid("empty path".to_string()));
    }
    let absolute = std::path::absolute(path)
        .map_err(|e| PluginError::PathInvalid(format!("{}: {}", path.display(), e)))?;

    let canonical = match tokio::fs::canonicalize(&absolute).await {
        Ok(canonical) => canonical,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PluginError::FileNotFound(absolute.display().to_string()))
        }
        Err(e) => return Err(PluginError::io(&absolute, e)),
    };

    let metadata = tokio::fs::metadata(&canonical)
        .await
        .map_err(|e| PluginError::io(&canonical, e))?;
    if !metadata.is_file() {
        return Err(PluginError::PathInvalid(format!(
            "{} is not a file",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Normalize a path that may no longer exist on disk, e.g. a deleted module
/// being unloaded
async fn lenient_normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = tokio::fs::canonicalize(path).await {
        return canonical;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match tokio::fs::canonicalize(parent).await {
            Ok(parent) => parent.join(name),
            Err(_) => absolute,
        },
        _ => absolute,
    }
}
