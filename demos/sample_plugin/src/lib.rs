//! Sample Plugin Implementation
//!
//! Build with `cargo build --release` and copy the resulting dynamic library
//! into the host's plugin directory. Rebuilding while the host runs with
//! `hot_reload` enabled swaps the new build in.

use chrono::{DateTime, Utc};
use shell_plugins::plugins::{HookResult, Plugin};

/// Session clock shown in the shell's status area
#[derive(Default)]
pub struct SessionClock {
    started: Option<DateTime<Utc>>,
}

impl SessionClock {
    /// Time since the plugin was loaded
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.started.map(|started| Utc::now() - started)
    }
}

impl Plugin for SessionClock {
    fn key(&self) -> &str {
        "session-clock"
    }

    fn name(&self) -> &str {
        "Session Clock"
    }

    fn icon(&self) -> &str {
        "clock"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn author(&self) -> &str {
        "n-takatsu"
    }

    fn description(&self) -> &str {
        "Shows how long the current session has been running"
    }

    fn on_load(&mut self) -> HookResult {
        self.started = Some(Utc::now());
        Ok(())
    }

    fn on_unload(&mut self) -> HookResult {
        if self.started.take().is_none() {
            return Err("session clock was never started".into());
        }
        Ok(())
    }
}

shell_plugins::export_plugin!(SessionClock);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut clock = SessionClock::default();
        assert!(clock.uptime().is_none());
        clock.on_load().unwrap();
        assert!(clock.uptime().is_some());
        clock.on_unload().unwrap();
        assert!(clock.on_unload().is_err());
    }

    #[test]
    fn test_exports() {
        assert_eq!(shell_plugin_count(), 1);
        let raw = shell_plugin_create(0);
        assert!(!raw.is_null());
        // SAFETY: created above by this module's factory
        let plugin = unsafe { Box::from_raw(raw as *mut Box<dyn Plugin>) };
        assert_eq!(plugin.key(), "session-clock");
        assert!(shell_plugin_create(1).is_null());
    }
}
