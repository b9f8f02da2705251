//! # shell-plugins
//!
//! Plugin loading and hot-reload host for a desktop session-management shell.
//!
//! Plugin modules are dynamic libraries discovered under a plugin directory.
//! Each one is loaded into its own isolation unit, tracked by normalized path
//! and content hash, hot-reloaded when its bytes change, and unloaded without
//! restarting the host. See [`plugins`] for the loader itself.

pub mod config;
pub mod error;
pub mod logging;
pub mod plugins;

pub use config::{HostConfig, PluginSettings};
pub use error::{Error, Result};
pub use plugins::{
    Plugin, PluginError, PluginEvent, PluginInstance, PluginLoader, PluginManager,
    PluginMetadata, PluginStatus, PluginWatcher,
};
