//! Host configuration
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then environment variables prefixed `SHELL_PLUGINS__`
//! (nested keys separated by `__`, e.g.
//! `SHELL_PLUGINS__PLUGINS__PLUGIN_DIR=/opt/shell/plugins`).

use crate::error::Result;
use crate::logging::LogConfig;
use crate::plugins::isolation::DEFAULT_DEBUG_SYMBOL_EXTENSION;
use crate::plugins::{DrainPolicy, NameExclusions};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration files tried when no explicit path is given
const DEFAULT_CONFIG_FILES: &[&str] = &["shell-plugins", "config/shell-plugins"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub plugins: PluginSettings,
    pub logging: LogConfig,
}

/// Plugin subsystem settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Directory scanned for plugin modules
    pub plugin_dir: PathBuf,
    /// Extension of plugin module files, without the dot
    pub module_extension: String,
    /// Extension of companion debug-symbol files
    pub debug_symbol_extension: String,
    /// The host's own module name, never loaded as a plugin
    pub host_module: String,
    /// Shared/framework modules: skipped by discovery and always taken from
    /// the host instead of a plugin's private dependencies. A trailing `*`
    /// matches by prefix.
    pub shared_modules: Vec<String>,
    /// Load every discovered plugin at startup
    pub auto_load: bool,
    /// Watch the plugin directory and reload changed modules
    pub hot_reload: bool,
    /// Quiet period before a burst of file events is acted on
    pub watch_debounce_ms: u64,
    /// Longest a change waits while events keep arriving
    pub watch_max_delay_ms: u64,
    /// Liveness checks after unload before a unit is declared released
    pub drain_attempts: u32,
    /// Delay between liveness checks
    pub drain_interval_ms: u64,
}

impl Default for PluginSettings {
    fn default() -> Self {
        let drain = DrainPolicy::default();
        Self {
            plugin_dir: default_plugin_dir(),
            module_extension: std::env::consts::DLL_EXTENSION.to_string(),
            debug_symbol_extension: DEFAULT_DEBUG_SYMBOL_EXTENSION.to_string(),
            host_module: env!("CARGO_CRATE_NAME").to_string(),
            shared_modules: vec!["std-*".to_string(), "libstd-*".to_string()],
            auto_load: true,
            hot_reload: true,
            watch_debounce_ms: 250,
            watch_max_delay_ms: 2000,
            drain_attempts: drain.attempts,
            drain_interval_ms: drain.interval.as_millis() as u64,
        }
    }
}

impl PluginSettings {
    /// Settings rooted at `plugin_dir`, everything else default
    pub fn with_plugin_dir(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            ..Self::default()
        }
    }

    /// Modules always resolved from the host
    pub fn shared_exclusions(&self) -> NameExclusions {
        NameExclusions::new(&self.shared_modules)
    }

    /// Names discovery must skip: the host module plus shared modules
    pub fn discovery_exclusions(&self) -> NameExclusions {
        let mut exclusions = self.shared_exclusions();
        exclusions.add(&self.host_module);
        exclusions
    }

    pub fn drain_policy(&self) -> DrainPolicy {
        DrainPolicy {
            attempts: self.drain_attempts,
            interval: Duration::from_millis(self.drain_interval_ms),
        }
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    /// Upper bound on how long a pending change is held back, never shorter
    /// than the debounce period
    pub fn watch_max_delay(&self) -> Duration {
        Duration::from_millis(self.watch_max_delay_ms.max(self.watch_debounce_ms))
    }
}

/// Per-user data directory for plugins, falling back to `./plugins`
pub fn default_plugin_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "shell", "shell-plugins")
        .map(|dirs| dirs.data_dir().join("plugins"))
        .unwrap_or_else(|| PathBuf::from("plugins"))
}

impl HostConfig {
    /// Load configuration from defaults, a file and the environment
    ///
    /// An explicit `path` must exist; otherwise the default locations are
    /// tried and silently skipped when absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&HostConfig::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                for name in DEFAULT_CONFIG_FILES {
                    builder = builder.add_source(File::with_name(name).required(false));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SHELL_PLUGINS")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("plugins.shared_modules")
                .try_parsing(true),
        );

        let config: HostConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Commented sample configuration file
    pub fn sample_toml() -> Result<String> {
        let body = toml::to_string_pretty(&HostConfig::default())?;
        Ok(format!(
            r#"# shell-plugins configuration
#
# Save as shell-plugins.toml. Any value can be overridden from the
# environment, e.g. SHELL_PLUGINS__PLUGINS__HOT_RELOAD=false
#
# [plugins]
# plugin_dir        directory scanned for plugin modules
# shared_modules    modules always taken from the host; trailing * = prefix
# watch_max_delay_ms  longest a change waits while the directory stays busy
# drain_attempts    liveness checks after unload before giving up waiting
#
# [logging]
# level             trace, debug, info, warn, error or a filter directive
# log_dir           enables rolling JSON log files in this directory

{}"#,
            body
        ))
    }
}
