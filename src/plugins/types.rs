//! Plugin Type Definitions
//!
//! Common types and utilities for the plugin system.

use super::{PluginInstance, PluginStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Plugin ABI constants
pub mod api {
    use std::ffi::CStr;

    /// Symbol returning the API version the module was built against
    pub const PLUGIN_API_VERSION_SYMBOL: &[u8] = b"shell_plugin_api_version\0";

    /// Symbol returning the number of plugin implementations in the module
    pub const PLUGIN_COUNT_SYMBOL: &[u8] = b"shell_plugin_count\0";

    /// Symbol instantiating the plugin implementation at a given index
    pub const PLUGIN_CREATE_SYMBOL: &[u8] = b"shell_plugin_create\0";

    /// NUL-terminated copy of [`super::super::PLUGIN_API_VERSION`]
    pub const PLUGIN_API_VERSION_CSTR: &CStr = c"0.1.0";

    /// Signature of [`PLUGIN_API_VERSION_SYMBOL`]
    pub type PluginApiVersionFn = unsafe extern "C" fn() -> *const std::os::raw::c_char;

    /// Signature of [`PLUGIN_COUNT_SYMBOL`]
    pub type PluginCountFn = unsafe extern "C" fn() -> usize;

    /// Signature of [`PLUGIN_CREATE_SYMBOL`]. Returns a `Box<Box<dyn Plugin>>`
    /// as a thin raw pointer, or null on failure.
    pub type PluginCreateFn = unsafe extern "C" fn(usize) -> *mut std::ffi::c_void;
}

/// Export one or more plugin types from a `cdylib` crate
///
/// Each type must implement [`Plugin`](crate::plugins::Plugin) and
/// [`Default`]. When several types are listed the host instantiates the
/// first one only.
#[macro_export]
macro_rules! export_plugin {
    ($($plugin_type:ty),+ $(,)?) => {
        #[no_mangle]
        pub extern "C" fn shell_plugin_api_version() -> *const ::std::os::raw::c_char {
            $crate::plugins::types::api::PLUGIN_API_VERSION_CSTR.as_ptr()
        }

        #[no_mangle]
        pub extern "C" fn shell_plugin_count() -> usize {
            [$(stringify!($plugin_type)),+].len()
        }

        #[no_mangle]
        pub extern "C" fn shell_plugin_create(index: usize) -> *mut ::std::ffi::c_void {
            let factories: &[fn() -> ::std::boxed::Box<dyn $crate::plugins::Plugin>] = &[
                $(|| -> ::std::boxed::Box<dyn $crate::plugins::Plugin> {
                    ::std::boxed::Box::new(<$plugin_type as ::std::default::Default>::default())
                }),+
            ];
            match factories.get(index) {
                Some(factory) => match ::std::panic::catch_unwind(*factory) {
                    Ok(plugin) => {
                        ::std::boxed::Box::into_raw(::std::boxed::Box::new(plugin))
                            as *mut ::std::ffi::c_void
                    }
                    Err(_) => ::std::ptr::null_mut(),
                },
                None => ::std::ptr::null_mut(),
            }
        }
    };
}

/// Metadata tracked for every loaded plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Normalized absolute path of the module file
    pub path: PathBuf,
    /// Stable key reported by the plugin
    pub key: String,
    /// Display name
    pub name: String,
    /// Icon identifier
    pub icon: String,
    /// Plugin version
    pub version: String,
    /// Plugin author
    pub author: String,
    /// Plugin description
    pub description: String,
    /// API version string exported by the module, if any
    pub api_version: Option<String>,
    /// When this generation of the module was loaded
    pub loaded_at: DateTime<Utc>,
    /// Cleared once the plugin is unloaded
    pub loaded: bool,
    /// SHA-256 of the module bytes, lowercase hex
    pub hash: String,
}

impl PluginMetadata {
    /// File name of the module, for log messages
    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }
}

/// Successful result of [`PluginLoader::load_or_reload`](super::PluginLoader::load_or_reload)
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub metadata: PluginMetadata,
    /// True when a previously loaded generation was replaced
    pub was_reloaded: bool,
}

/// Events raised to the UI and other collaborators
#[derive(Debug, Clone)]
pub enum PluginEvent {
    /// A plugin was loaded and its load hook succeeded
    Loaded {
        metadata: PluginMetadata,
        instance: Arc<PluginInstance>,
    },
    /// A plugin was unloaded (including the old generation during a reload)
    Unloaded { metadata: PluginMetadata },
    /// Status transition, including failures
    StatusChanged {
        path: PathBuf,
        metadata: Option<PluginMetadata>,
        status: PluginStatus,
        message: String,
    },
}

impl PluginEvent {
    /// Path of the module the event refers to
    pub fn path(&self) -> &Path {
        match self {
            PluginEvent::Loaded { metadata, .. } | PluginEvent::Unloaded { metadata } => {
                &metadata.path
            }
            PluginEvent::StatusChanged { path, .. } => path,
        }
    }
}

/// Synchronous receiver of plugin events
///
/// Observers run inside the structural operation that raised the event and
/// must not call back into the loader's structural operations.
pub trait PluginObserver: Send + Sync {
    fn on_event(&self, event: &PluginEvent);
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
