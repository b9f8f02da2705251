//! Plugin System for Dynamic Loading
//!
//! Loads plugin modules (dynamic libraries) at runtime, tracks their identity
//! by normalized path and content hash, and hot-reloads or unloads them
//! without restarting the host.
//!
//! # Examples
//!
//! ## Discovering and loading plugins
//!
//! ```rust,no_run
//! use shell_plugins::config::PluginSettings;
//! use shell_plugins::plugins::PluginLoader;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = PluginSettings::default();
//! let loader = PluginLoader::new(&settings);
//!
//! for path in &loader.discover(&settings.plugin_dir) {
//!     match loader.load_or_reload(&path).await {
//!         Ok(outcome) => println!("loaded {} v{}", outcome.metadata.name, outcome.metadata.version),
//!         Err(e) => eprintln!("failed to load {:?}: {}", path, e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Writing a plugin
//!
//! ```rust,ignore
//! use shell_plugins::plugins::{HookResult, Plugin};
//!
//! #[derive(Default)]
//! pub struct Clock;
//!
//! impl Plugin for Clock {
//!     fn key(&self) -> &str { "clock" }
//!     fn name(&self) -> &str { "Clock" }
//!     fn icon(&self) -> &str { "clock" }
//!     fn version(&self) -> &str { "1.0.0" }
//!     fn author(&self) -> &str { "Shell Team" }
//!     fn description(&self) -> &str { "Shows the time" }
//!     fn on_load(&mut self) -> HookResult { Ok(()) }
//!     fn on_unload(&mut self) -> HookResult { Ok(()) }
//! }
//!
//! shell_plugins::export_plugin!(Clock);
//! ```

pub mod discovery;
pub mod instance;
pub mod isolation;
pub mod loader;
pub mod manager;
pub mod types;
pub mod watcher;

pub use discovery::{Discovery, DiscoveryIter, NameExclusions};
pub use instance::PluginInstance;
pub use isolation::{
    DependencySource, IsolationUnit, ModuleImage, NativeUnit, NativeUnitFactory, UnitFactory,
};
pub use loader::{DrainPolicy, PluginLoader};
pub use manager::{InMemoryToolRegistry, PluginManager, ToolRegistry};
pub use types::*;
pub use watcher::{Debouncer, PluginWatcher, WatchAction};

/// Error returned by plugin hooks
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a plugin lifecycle hook
pub type HookResult = Result<(), HookError>;

/// Contract every plugin module must implement exactly once
///
/// The descriptive accessors are read once at load time and copied into
/// host-owned [`PluginMetadata`]; they should be cheap and side-effect free.
pub trait Plugin: Send + Sync {
    /// Stable identifier, unique across plugins
    fn key(&self) -> &str;

    /// Human readable name
    fn name(&self) -> &str;

    /// Icon identifier understood by the shell UI
    fn icon(&self) -> &str;

    /// Plugin version
    fn version(&self) -> &str;

    /// Plugin author
    fn author(&self) -> &str;

    /// Short description
    fn description(&self) -> &str;

    /// Called once after the module is instantiated. An error aborts the load.
    fn on_load(&mut self) -> HookResult;

    /// Called before the module is torn down. Errors are logged and ignored.
    fn on_unload(&mut self) -> HookResult;
}

/// Plugin status reported with status-change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PluginStatus {
    /// Plugin is loaded and its load hook succeeded
    Loaded,
    /// Plugin was unloaded
    Unloaded,
    /// A structural operation on the plugin failed
    Error,
}

/// Plugin loading errors
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Invalid plugin path: {0}")]
    PathInvalid(String),

    #[error("Plugin file not found: {0}")]
    FileNotFound(String),

    #[error("No plugin implementation found in {0}")]
    NoContractImplementationFound(String),

    #[error("Plugin instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("Plugin load hook failed: {0}")]
    LoadHookFailed(String),

    #[error("Plugin unload hook failed: {0}")]
    UnloadHookFailed(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Plugin '{0}' has been unloaded")]
    Unloaded(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PluginError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        PluginError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Plugin API version carried by every module built against this crate
pub const PLUGIN_API_VERSION: &str = "0.1.0";

/// Turn a caught panic payload into a readable message
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let owned = std::panic::catch_unwind(|| panic!("{}", String::from("owned"))).unwrap_err();
        assert_eq!(panic_message(owned.as_ref()), "owned");
    }

    #[test]
    fn test_error_messages() {
        let err = PluginError::NoContractImplementationFound("/tmp/a.so".to_string());
        assert!(err.to_string().contains("/tmp/a.so"));

        let err = PluginError::io(
            std::path::Path::new("/tmp/b.so"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/b.so"));
    }
}
