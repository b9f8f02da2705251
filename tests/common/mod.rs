//! Shared fixtures: an in-memory isolation unit whose "module" is a small
//! `key=value` text file, plus helpers for writing such files.
//!
//! Recognised keys:
//!
//! - `plugins`: comma-separated plugin keys, in enumeration order (empty = none)
//! - `version`: reported plugin version
//! - `fail_load` / `fail_unload`: hook returns an error
//! - `panic`: `instantiate` or `load` panics at that step
//! - `linger`: number of liveness checks the unit keeps reporting live after unload
//! - `open_delay_ms`: blocking sleep inside `load`, like a slow `dlopen`

#![allow(dead_code)]

use shell_plugins::config::PluginSettings;
use shell_plugins::plugins::isolation::ModuleExports;
use shell_plugins::plugins::{
    HookResult, IsolationUnit, ModuleImage, Plugin, PluginError, PluginEvent, PluginObserver,
    UnitFactory,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const EXTENSION: &str = "pluginlib";

/// Ordered record of everything the fake units and plugins did
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    /// Highest number of fake operations ever observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Mark a blocking section so overlapping structural operations show up
    fn busy(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(15));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
struct ModuleRecipe {
    plugins: Vec<String>,
    version: String,
    fail_load: bool,
    fail_unload: bool,
    panic: Option<String>,
    linger: usize,
    open_delay_ms: u64,
}

impl ModuleRecipe {
    fn parse(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let values: BTreeMap<&str, &str> = text
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        Self {
            plugins: values
                .get("plugins")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            version: values.get("version").unwrap_or(&"1.0.0").to_string(),
            fail_load: values.get("fail_load").is_some_and(|v| *v == "true"),
            fail_unload: values.get("fail_unload").is_some_and(|v| *v == "true"),
            panic: values.get("panic").map(|v| v.to_string()),
            linger: values
                .get("linger")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            open_delay_ms: values
                .get("open_delay_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }
}

pub struct FakePlugin {
    key: String,
    version: String,
    fail_load: bool,
    fail_unload: bool,
    panic_on_load: bool,
    journal: Arc<Journal>,
}

impl Plugin for FakePlugin {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> &str {
        "Fake"
    }

    fn icon(&self) -> &str {
        "puzzle"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn author(&self) -> &str {
        "Tests"
    }

    fn description(&self) -> &str {
        "In-memory test plugin"
    }

    fn on_load(&mut self) -> HookResult {
        self.journal.record(format!("load:{}:{}", self.key, self.version));
        if self.panic_on_load {
            panic!("load hook exploded");
        }
        if self.fail_load {
            return Err("refusing to start".into());
        }
        Ok(())
    }

    fn on_unload(&mut self) -> HookResult {
        self.journal.busy();
        self.journal
            .record(format!("unload:{}:{}", self.key, self.version));
        if self.fail_unload {
            return Err("refusing to stop".into());
        }
        Ok(())
    }
}

impl Drop for FakePlugin {
    fn drop(&mut self) {
        self.journal.record(format!("drop:{}:{}", self.key, self.version));
    }
}

pub struct FakeUnit {
    id: Uuid,
    journal: Arc<Journal>,
    recipe: Option<ModuleRecipe>,
    name: String,
    linger: AtomicUsize,
}

impl IsolationUnit for FakeUnit {
    fn id(&self) -> Uuid {
        self.id
    }

    fn load(&mut self, image: &ModuleImage) -> Result<ModuleExports, PluginError> {
        self.journal.busy();
        let recipe = ModuleRecipe::parse(&image.bytes);
        if recipe.open_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(recipe.open_delay_ms));
        }
        self.name = image.file_name();
        self.journal.record(format!("open:{}", self.name));
        let implementations = recipe.plugins.len();
        self.recipe = Some(recipe);
        Ok(ModuleExports {
            implementations,
            api_version: Some("0.1.0".to_string()),
        })
    }

    fn instantiate(&mut self, index: usize) -> Result<Box<dyn Plugin>, PluginError> {
        let recipe = self
            .recipe
            .as_ref()
            .ok_or_else(|| PluginError::InstantiationFailed("not loaded".into()))?;
        if recipe.panic.as_deref() == Some("instantiate") {
            panic!("constructor exploded");
        }
        let key = recipe
            .plugins
            .get(index)
            .ok_or_else(|| PluginError::InstantiationFailed(format!("no plugin {}", index)))?;
        Ok(Box::new(FakePlugin {
            key: key.clone(),
            version: recipe.version.clone(),
            fail_load: recipe.fail_load,
            fail_unload: recipe.fail_unload,
            panic_on_load: recipe.panic.as_deref() == Some("load"),
            journal: self.journal.clone(),
        }))
    }

    fn unload(&mut self) {
        if let Some(recipe) = self.recipe.take() {
            self.journal.busy();
            self.linger.store(recipe.linger, Ordering::SeqCst);
            self.journal.record(format!("close:{}", self.name));
        }
    }

    fn is_alive(&self) -> bool {
        self.recipe.is_some() || self.linger.load(Ordering::SeqCst) > 0
    }

    fn reclaim(&mut self) {
        let linger = self.linger.load(Ordering::SeqCst);
        self.linger.store(linger.saturating_sub(1), Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeUnitFactory {
    pub journal: Arc<Journal>,
    pub created: AtomicUsize,
}

impl UnitFactory for FakeUnitFactory {
    fn create(&self, _module_path: &Path) -> Box<dyn IsolationUnit> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeUnit {
            id: Uuid::new_v4(),
            journal: self.journal.clone(),
            recipe: None,
            name: String::new(),
            linger: AtomicUsize::new(0),
        })
    }
}

/// Observer collecting every event it sees
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<PluginEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<PluginEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Compact `kind:key` rendering of each event
    pub fn summary(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|event| match event {
                PluginEvent::Loaded { metadata, .. } => format!("loaded:{}", metadata.key),
                PluginEvent::Unloaded { metadata } => format!("unloaded:{}", metadata.key),
                PluginEvent::StatusChanged {
                    metadata, status, ..
                } => format!(
                    "status:{:?}:{}",
                    status,
                    metadata.as_ref().map(|m| m.key.as_str()).unwrap_or("-")
                ),
            })
            .collect()
    }
}

impl PluginObserver for EventLog {
    fn on_event(&self, event: &PluginEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Settings for a temporary plugin directory using the fake extension
pub fn settings(dir: &Path) -> PluginSettings {
    PluginSettings {
        module_extension: EXTENSION.to_string(),
        drain_attempts: 3,
        drain_interval_ms: 1,
        watch_debounce_ms: 50,
        ..PluginSettings::with_plugin_dir(dir)
    }
}

/// Write a fake module `<name>.pluginlib` into `dir`
pub fn write_module(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(format!("{}.{}", name, EXTENSION));
    std::fs::write(&path, contents).unwrap();
    path
}
