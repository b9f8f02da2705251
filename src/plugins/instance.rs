//! Host-side handle to a live plugin object
//!
//! The plugin object's code lives inside its isolation unit. The handle keeps
//! the object behind a lock so teardown can take it out before the unit's
//! library is closed; calls through a handle that outlived its unit fail with
//! [`PluginError::Unloaded`] instead of jumping into unmapped code.

use super::{Plugin, PluginError};
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// Shared handle to a loaded plugin instance
pub struct PluginInstance {
    key: String,
    name: String,
    icon: String,
    version: String,
    author: String,
    description: String,
    slot: RwLock<Option<Box<dyn Plugin>>>,
}

impl PluginInstance {
    /// Wrap a freshly created plugin object, copying its descriptive fields
    pub(crate) fn new(plugin: Box<dyn Plugin>) -> Self {
        Self {
            key: plugin.key().to_string(),
            name: plugin.name().to_string(),
            icon: plugin.icon().to_string(),
            version: plugin.version().to_string(),
            author: plugin.author().to_string(),
            description: plugin.description().to_string(),
            slot: RwLock::new(Some(plugin)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether the plugin object is still present
    pub fn is_live(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `f` against the plugin object
    ///
    /// Holds a shared lock for the duration of the call, so teardown waits
    /// for in-flight calls to finish.
    pub fn with<R>(&self, f: impl FnOnce(&dyn Plugin) -> R) -> Result<R, PluginError> {
        let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_deref() {
            Some(plugin) => Ok(f(plugin)),
            None => Err(PluginError::Unloaded(self.key.clone())),
        }
    }

    /// Run `f` against the plugin object with exclusive access
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut dyn Plugin) -> R) -> Result<R, PluginError> {
        let mut guard = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        match guard.as_deref_mut() {
            Some(plugin) => Ok(f(plugin)),
            None => Err(PluginError::Unloaded(self.key.clone())),
        }
    }

    /// Take the plugin object out of the handle. Must happen before the
    /// owning unit unloads its code.
    pub(crate) fn retire(&self) -> Option<Box<dyn Plugin>> {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::HookResult;

    #[derive(Default)]
    struct Counter {
        loads: u32,
    }

    impl Plugin for Counter {
        fn key(&self) -> &str {
            "counter"
        }
        fn name(&self) -> &str {
            "Counter"
        }
        fn icon(&self) -> &str {
            "numbers"
        }
        fn version(&self) -> &str {
            "0.3.1"
        }
        fn author(&self) -> &str {
            "tests"
        }
        fn description(&self) -> &str {
            "Counts load calls"
        }
        fn on_load(&mut self) -> HookResult {
            self.loads += 1;
            Ok(())
        }
        fn on_unload(&mut self) -> HookResult {
            Ok(())
        }
    }

    #[test]
    fn test_descriptor_copied() {
        let instance = PluginInstance::new(Box::new(Counter::default()));
        assert_eq!(instance.key(), "counter");
        assert_eq!(instance.name(), "Counter");
        assert_eq!(instance.icon(), "numbers");
        assert_eq!(instance.version(), "0.3.1");
        assert!(instance.is_live());
    }

    #[test]
    fn test_retired_handle_rejects_calls() {
        let instance = PluginInstance::new(Box::new(Counter::default()));
        instance.with_mut(|p| p.on_load()).unwrap().unwrap();

        let plugin = instance.retire();
        assert!(plugin.is_some());
        assert!(!instance.is_live());

        let err = instance.with(|p| p.key().to_string()).unwrap_err();
        assert!(matches!(err, PluginError::Unloaded(ref key) if key == "counter"));

        // Cached fields stay readable without touching plugin code
        assert_eq!(instance.description(), "Counts load calls");
        assert!(instance.retire().is_none());
    }
}
