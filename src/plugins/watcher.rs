//! Plugin directory watcher
//!
//! Watches the plugin directory with `notify` and keeps the loaded set in step
//! with the files on disk. Raw events are classified per path, collected until
//! the directory has been quiet for the configured debounce period (or the
//! oldest pending change has waited the maximum delay), and then applied
//! through the [`PluginManager`]: a module that exists is loaded or
//! hot-reloaded, a module that is gone is unloaded.

use super::{Discovery, PluginManager};
use crate::error::Result;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What a file event asks the loader to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Reload(PathBuf),
    Unload(PathBuf),
}

impl WatchAction {
    pub fn path(&self) -> &Path {
        match self {
            WatchAction::Reload(path) | WatchAction::Unload(path) => path,
        }
    }
}

/// Map a raw notify event to actions on candidate modules
///
/// Paths that discovery would not yield (wrong extension, excluded names,
/// private dependency directories) are dropped.
pub fn classify_event(event: &Event, discovery: &Discovery) -> Vec<WatchAction> {
    let actions: Vec<WatchAction> = match &event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => event
            .paths
            .iter()
            .cloned()
            .map(WatchAction::Unload)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut actions = Vec::new();
            if let Some(from) = event.paths.first() {
                actions.push(WatchAction::Unload(from.clone()));
            }
            if let Some(to) = event.paths.get(1) {
                actions.push(WatchAction::Reload(to.clone()));
            }
            actions
        }
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .cloned()
            .map(WatchAction::Reload)
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    };

    actions
        .into_iter()
        .filter(|action| discovery.accepts(action.path()))
        .collect()
}

/// Per-path pending actions with a quiet-period deadline capped by a maximum
/// delay
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    max_delay: Duration,
    pending: BTreeMap<PathBuf, WatchAction>,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration, max_delay: Duration) -> Self {
        Self {
            quiet,
            max_delay: max_delay.max(quiet),
            pending: BTreeMap::new(),
            first_at: None,
            last_at: None,
        }
    }

    /// Queue an action; a later action for the same path replaces it
    pub fn push(&mut self, action: WatchAction, now: Instant) {
        self.first_at.get_or_insert(now);
        self.last_at = Some(now);
        self.pending.insert(action.path().to_path_buf(), action);
    }

    /// When the pending actions are due, if there are any
    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first_at?;
        let last = self.last_at?;
        Some((last + self.quiet).min(first + self.max_delay))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every pending action and reset the timers
    pub fn take(&mut self) -> BTreeMap<PathBuf, WatchAction> {
        self.first_at = None;
        self.last_at = None;
        std::mem::take(&mut self.pending)
    }
}

/// Running watcher; dropping it stops watching
pub struct PluginWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl PluginWatcher {
    /// Start watching the manager's plugin directory
    ///
    /// The directory is created if it does not exist. Must be called from
    /// within a tokio runtime.
    pub fn start(manager: Arc<PluginManager>) -> Result<Self> {
        let root = manager.settings().plugin_dir.clone();
        std::fs::create_dir_all(&root)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                // Receiver gone means the watcher is shutting down
                let _ = tx.send(result);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let discovery = manager.discover();
        let debouncer = Debouncer::new(
            manager.settings().watch_debounce(),
            manager.settings().watch_max_delay(),
        );
        let task = tokio::spawn(watch_loop(manager, discovery, rx, debouncer));

        info!("Watching {} for plugin changes", root.display());
        Ok(Self {
            root,
            _watcher: watcher,
            task,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        debug!("Stopping plugin watcher for {}", self.root.display());
        self.task.abort();
    }
}

async fn watch_loop(
    manager: Arc<PluginManager>,
    discovery: Discovery,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    mut debouncer: Debouncer,
) {
    loop {
        let received = match debouncer.deadline() {
            None => events.recv().await,
            Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    flush(&manager, debouncer.take()).await;
                    continue;
                }
            },
        };

        match received {
            Some(Ok(event)) => {
                for action in classify_event(&event, &discovery) {
                    debug!("Queued {:?}", action);
                    debouncer.push(action, Instant::now());
                }
            }
            Some(Err(e)) => error!("Plugin directory watch error: {}", e),
            None => break,
        }
    }

    if !debouncer.is_empty() {
        flush(&manager, debouncer.take()).await;
    }
}

/// Apply queued actions. The file's presence on disk at this point decides
/// between reload and unload, so a remove followed by a re-create within one
/// debounce window ends up as a reload.
async fn flush(manager: &PluginManager, pending: BTreeMap<PathBuf, WatchAction>) {
    for (path, action) in pending {
        let exists = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);

        if exists {
            match manager.load_or_reload(&path).await {
                Ok(outcome) if outcome.was_reloaded => {
                    info!("Hot-reloaded '{}'", outcome.metadata.key)
                }
                Ok(outcome) => debug!("'{}' is up to date", outcome.metadata.key),
                // The loader already logged and published the failure
                Err(_) => {}
            }
        } else if !manager.unload(&path).await {
            if matches!(action, WatchAction::Unload(_)) {
                debug!("Removed file {:?} was not loaded", path);
            } else {
                warn!("{:?} disappeared before it could be loaded", path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::NameExclusions;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};

    fn discovery() -> Discovery {
        Discovery::new("/p", "pluginlib", NameExclusions::new(["Host"]))
    }

    #[test]
    fn test_create_and_modify_reload() {
        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/p/A.pluginlib"));
        assert_eq!(
            classify_event(&create, &discovery()),
            vec![WatchAction::Reload(PathBuf::from("/p/A.pluginlib"))]
        );

        let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from("/p/A.pluginlib"));
        assert_eq!(
            classify_event(&modify, &discovery()),
            vec![WatchAction::Reload(PathBuf::from("/p/A.pluginlib"))]
        );
    }

    #[test]
    fn test_remove_unloads() {
        let remove = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/p/A.pluginlib"));
        assert_eq!(
            classify_event(&remove, &discovery()),
            vec![WatchAction::Unload(PathBuf::from("/p/A.pluginlib"))]
        );
    }

    #[test]
    fn test_rename_unloads_source_and_reloads_target() {
        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/p/A.pluginlib"))
            .add_path(PathBuf::from("/p/B.pluginlib"));
        assert_eq!(
            classify_event(&rename, &discovery()),
            vec![
                WatchAction::Unload(PathBuf::from("/p/A.pluginlib")),
                WatchAction::Reload(PathBuf::from("/p/B.pluginlib")),
            ]
        );

        // Staging a download under another name, then renaming it into place
        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/p/A.pluginlib.part"))
            .add_path(PathBuf::from("/p/A.pluginlib"));
        assert_eq!(
            classify_event(&rename, &discovery()),
            vec![WatchAction::Reload(PathBuf::from("/p/A.pluginlib"))]
        );
    }

    #[test]
    fn test_debouncer_waits_for_quiet_period() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(100), Duration::from_secs(1));
        assert!(debouncer.deadline().is_none());

        debouncer.push(WatchAction::Reload(PathBuf::from("/p/A.pluginlib")), start);
        assert_eq!(debouncer.deadline(), Some(start + Duration::from_millis(100)));

        let later = start + Duration::from_millis(60);
        debouncer.push(WatchAction::Unload(PathBuf::from("/p/A.pluginlib")), later);
        assert_eq!(debouncer.deadline(), Some(later + Duration::from_millis(100)));

        let pending = debouncer.take();
        assert_eq!(
            pending.into_values().collect::<Vec<_>>(),
            vec![WatchAction::Unload(PathBuf::from("/p/A.pluginlib"))]
        );
        assert!(debouncer.is_empty());
        assert!(debouncer.deadline().is_none());
    }

    #[test]
    fn test_debouncer_caps_busy_directory() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(100), Duration::from_millis(300));

        // An event every 50ms would otherwise keep pushing the deadline out
        for step in 0..20u64 {
            let now = start + Duration::from_millis(step * 50);
            debouncer.push(WatchAction::Reload(PathBuf::from("/p/A.pluginlib")), now);
            assert!(debouncer.deadline().unwrap() <= start + Duration::from_millis(300));
        }
        assert_eq!(debouncer.deadline(), Some(start + Duration::from_millis(300)));

        debouncer.take();
        let restart = start + Duration::from_secs(5);
        debouncer.push(WatchAction::Reload(PathBuf::from("/p/B.pluginlib")), restart);
        assert_eq!(debouncer.deadline(), Some(restart + Duration::from_millis(100)));
    }

    #[test]
    fn test_ignored_events_and_paths() {
        let access = Event::new(EventKind::Access(AccessKind::Read))
            .add_path(PathBuf::from("/p/A.pluginlib"));
        assert!(classify_event(&access, &discovery()).is_empty());

        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/p/readme.txt"))
            .add_path(PathBuf::from("/p/Host.pluginlib"))
            .add_path(PathBuf::from("/p/A.deps/helper.pluginlib"));
        assert!(classify_event(&create, &discovery()).is_empty());
    }
}
