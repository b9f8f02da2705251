//! Plugin module discovery
//!
//! Walks a plugin directory recursively and yields candidate module files.
//! Nothing is opened or validated here; a candidate only has to carry the
//! module extension and not be one of the host's own or shared modules.
//! Private dependency directories (`<stem>.deps`) are never descended into.

use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Suffix of a module's private dependency directory
pub const DEPS_DIR_SUFFIX: &str = ".deps";

type EntryFilter = fn(&DirEntry) -> bool;

fn is_deps_dir_name(name: &str) -> bool {
    name.len() > DEPS_DIR_SUFFIX.len() && name.ends_with(DEPS_DIR_SUFFIX)
}

fn not_deps_dir(entry: &DirEntry) -> bool {
    !(entry.file_type().is_dir() && is_deps_dir_name(&entry.file_name().to_string_lossy()))
}

/// Module names that must never be loaded as plugins
///
/// Entries ending in `*` match by prefix against the file name, all other
/// entries match the file stem exactly. A leading `lib` on the stem is
/// ignored for exact matches so `libfoo.so` and `foo.dll` are treated alike.
/// Comparisons are ASCII case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameExclusions {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl NameExclusions {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exclusions = Self::default();
        for pattern in patterns {
            exclusions.add(pattern.as_ref());
        }
        exclusions
    }

    /// Add one pattern
    pub fn add(&mut self, pattern: &str) {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => self.prefixes.push(prefix.to_ascii_lowercase()),
            None => self.exact.push(pattern.to_ascii_lowercase()),
        }
    }

    /// Whether the file at `path` is excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        let file_name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_ascii_lowercase(),
            None => return false,
        };
        if self.prefixes.iter().any(|p| file_name.starts_with(p)) {
            return true;
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let bare = stem.strip_prefix("lib").unwrap_or(&stem);
        self.exact.iter().any(|e| e.as_str() == stem || e.as_str() == bare)
    }

    /// Whether a dependency called `name` is excluded
    pub fn is_excluded_name(&self, name: &str) -> bool {
        self.is_excluded(Path::new(name))
    }
}

/// Lazy, restartable scan of a plugin directory
///
/// Each call to [`Discovery::iter`] (or iterating `&Discovery`) starts a new
/// walk, so files added between scans are picked up.
#[derive(Debug, Clone)]
pub struct Discovery {
    root: PathBuf,
    extension: String,
    exclusions: NameExclusions,
}

impl Discovery {
    pub fn new(root: impl Into<PathBuf>, extension: &str, exclusions: NameExclusions) -> Self {
        Self {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_ascii_lowercase(),
            exclusions,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new scan
    pub fn iter(&self) -> DiscoveryIter<'_> {
        let walker = if self.root.is_dir() {
            debug!("Scanning plugin directory: {:?}", self.root);
            Some(
                WalkDir::new(&self.root)
                    .follow_links(false)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_entry(not_deps_dir as EntryFilter),
            )
        } else {
            debug!("Plugin directory does not exist: {:?}", self.root);
            None
        };
        DiscoveryIter {
            discovery: self,
            walker,
        }
    }

    /// Whether `path` would be yielded by a scan, ignoring its location
    pub fn accepts(&self, path: &Path) -> bool {
        let has_extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false);
        let in_deps_dir = path
            .parent()
            .map(|parent| {
                parent
                    .components()
                    .any(|c| is_deps_dir_name(&c.as_os_str().to_string_lossy()))
            })
            .unwrap_or(false);
        has_extension && !in_deps_dir && !self.exclusions.is_excluded(path)
    }
}

impl<'a> IntoIterator for &'a Discovery {
    type Item = PathBuf;
    type IntoIter = DiscoveryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over candidate module paths
pub struct DiscoveryIter<'a> {
    discovery: &'a Discovery,
    walker: Option<walkdir::FilterEntry<walkdir::IntoIter, EntryFilter>>,
}

impl Iterator for DiscoveryIter<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        let walker = self.walker.as_mut()?;
        loop {
            match walker.next()? {
                Ok(entry) => {
                    if entry.file_type().is_file() && self.discovery.accepts(entry.path()) {
                        return Some(entry.into_path());
                    }
                }
                Err(e) => debug!("Skipping unreadable entry during discovery: {}", e),
            }
        }
    }
}
