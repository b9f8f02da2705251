//! Isolation units
//!
//! An isolation unit owns everything acquired while loading one plugin
//! module: a private staging directory holding the copy of the module the OS
//! loader actually opens, the library handle, and the private companion
//! dependencies staged next to it. Tearing a unit down closes the library and
//! deletes the staging directory; no other unit is affected.
//!
//! The module bytes are read into memory by the loader and written into the
//! staging directory, so the original file can be replaced on disk while the
//! loaded generation keeps running, and two generations of the same path never
//! share an OS loader cache entry.
//!
//! Private dependencies live in `<module-dir>/<module-stem>.deps/`. They are
//! staged beside the module copy (where an `$ORIGIN`-relative rpath on Unix or
//! the DLL search order on Windows finds them first) unless their name is on
//! the shared-module list, in which case the host's copy is used.

use super::api::{
    PluginApiVersionFn, PluginCountFn, PluginCreateFn, PLUGIN_API_VERSION_SYMBOL,
    PLUGIN_COUNT_SYMBOL, PLUGIN_CREATE_SYMBOL,
};
use super::discovery::{NameExclusions, DEPS_DIR_SUFFIX};
use super::types::display_name;
use super::{Plugin, PluginError};
use libloading::Library;
use sha2::{Digest, Sha256};
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default extension of companion debug-symbol files
#[cfg(windows)]
pub const DEFAULT_DEBUG_SYMBOL_EXTENSION: &str = "pdb";
#[cfg(not(windows))]
pub const DEFAULT_DEBUG_SYMBOL_EXTENSION: &str = "dwp";

/// Companion debug symbols read alongside a module
#[derive(Debug, Clone)]
pub struct DebugSymbols {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// In-memory copy of a module file
#[derive(Debug, Clone)]
pub struct ModuleImage {
    /// Normalized path the bytes were read from
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub debug_symbols: Option<DebugSymbols>,
    /// SHA-256 of `bytes`, lowercase hex
    pub hash: String,
}

impl ModuleImage {
    /// Read a module and its optional debug symbols fully into memory
    pub async fn read(path: &Path, debug_symbol_extension: &str) -> Result<Self, PluginError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PluginError::io(path, e))?;
        let hash = content_hash(&bytes);

        let symbols_path = path.with_extension(debug_symbol_extension);
        let debug_symbols = if tokio::fs::metadata(&symbols_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            match tokio::fs::read(&symbols_path).await {
                Ok(bytes) => Some(DebugSymbols {
                    file_name: display_name(&symbols_path),
                    bytes,
                }),
                Err(e) => {
                    warn!("Ignoring unreadable debug symbols {:?}: {}", symbols_path, e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            bytes,
            debug_symbols,
            hash,
        })
    }

    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }
}

/// SHA-256 of `bytes` as lowercase hex
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// What a module exposes once opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleExports {
    /// Number of plugin implementations, in enumeration order
    pub implementations: usize,
    /// API version string reported by the module, if it exports one
    pub api_version: Option<String>,
}

/// Owning boundary for one loaded module
pub trait IsolationUnit: Send + Sync {
    /// Identifier used in logs
    fn id(&self) -> Uuid;

    /// Open the module from its in-memory image
    fn load(&mut self, image: &ModuleImage) -> Result<ModuleExports, PluginError>;

    /// Create the plugin implementation at `index`
    fn instantiate(&mut self, index: usize) -> Result<Box<dyn Plugin>, PluginError>;

    /// Release the module. Idempotent. Every plugin object created by this
    /// unit must already have been dropped.
    fn unload(&mut self);

    /// Weak liveness check used by the drain loop after [`unload`](Self::unload)
    fn is_alive(&self) -> bool;

    /// Give the unit a chance to release deferred resources between drain polls
    fn reclaim(&mut self) {}
}

/// Creates a fresh isolation unit for a module path
pub trait UnitFactory: Send + Sync {
    fn create(&self, module_path: &Path) -> Box<dyn IsolationUnit>;
}

/// Where a named dependency of a module comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencySource {
    /// The module's own copy under its `.deps` directory
    Private(PathBuf),
    /// The host-provided copy
    Shared,
}

/// Resolves a module's dependencies against its private `.deps` directory
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    deps_dir: PathBuf,
    shared: NameExclusions,
}

impl DependencyResolver {
    pub fn for_module(module_path: &Path, shared: NameExclusions) -> Self {
        let stem = module_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = module_path.parent().unwrap_or_else(|| Path::new("."));
        Self {
            deps_dir: dir.join(format!("{}{}", stem, DEPS_DIR_SUFFIX)),
            shared,
        }
    }

    pub fn deps_dir(&self) -> &Path {
        &self.deps_dir
    }

    /// Resolve a dependency by file name, private copy first
    pub fn resolve(&self, name: &str) -> DependencySource {
        if self.shared.is_excluded_name(name) {
            return DependencySource::Shared;
        }
        let candidate = self.deps_dir.join(name);
        if candidate.is_file() {
            DependencySource::Private(candidate)
        } else {
            DependencySource::Shared
        }
    }

    /// All private dependencies that should be staged with the module
    pub fn private_dependencies(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.deps_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut deps: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                match self.resolve(&name) {
                    DependencySource::Private(path) => Some(path),
                    DependencySource::Shared => None,
                }
            })
            .collect();
        deps.sort();
        deps
    }
}

/// Isolation unit backed by a native dynamic library
pub struct NativeUnit {
    id: Uuid,
    resolver: DependencyResolver,
    staging: Option<TempDir>,
    library: Option<Arc<Library>>,
    released: Weak<Library>,
}

impl NativeUnit {
    pub fn new(resolver: DependencyResolver) -> Self {
        Self {
            id: Uuid::new_v4(),
            resolver,
            staging: None,
            library: None,
            released: Weak::new(),
        }
    }

    fn stage(&self, staging: &TempDir, image: &ModuleImage) -> Result<PathBuf, PluginError> {
        let module_path = staging.path().join(image.file_name());
        std::fs::write(&module_path, &image.bytes).map_err(|e| PluginError::io(&module_path, e))?;

        if let Some(symbols) = &image.debug_symbols {
            let symbols_path = staging.path().join(&symbols.file_name);
            std::fs::write(&symbols_path, &symbols.bytes)
                .map_err(|e| PluginError::io(&symbols_path, e))?;
        }

        for dep in self.resolver.private_dependencies() {
            let target = staging.path().join(display_name(&dep));
            std::fs::copy(&dep, &target).map_err(|e| PluginError::io(&dep, e))?;
            debug!("Unit {} staged private dependency {:?}", self.id, target);
        }

        Ok(module_path)
    }

    fn library(&self) -> Result<&Library, PluginError> {
        self.library
            .as_deref()
            .ok_or_else(|| PluginError::InstantiationFailed("isolation unit is not loaded".into()))
    }
}

impl IsolationUnit for NativeUnit {
    fn id(&self) -> Uuid {
        self.id
    }

    fn load(&mut self, image: &ModuleImage) -> Result<ModuleExports, PluginError> {
        if self.library.is_some() {
            return Err(PluginError::Internal(format!(
                "isolation unit {} already holds a module",
                self.id
            )));
        }

        let staging = tempfile::Builder::new()
            .prefix("shell-plugin-")
            .tempdir()
            .map_err(|e| PluginError::io(&std::env::temp_dir(), e))?;
        let staged = self.stage(&staging, image)?;
        self.staging = Some(staging);

        // SAFETY: opening a library runs its initializers; plugin modules are
        // trusted code built against this crate.
        let library = unsafe { Library::new(&staged) }
            .map_err(|e| PluginError::InstantiationFailed(e.to_string()))?;

        // SAFETY: symbol types match the signatures generated by `export_plugin!`.
        let count = unsafe { library.get::<PluginCountFn>(PLUGIN_COUNT_SYMBOL) }
            .map_err(|_| PluginError::NoContractImplementationFound(image.file_name()))?;
        let implementations = unsafe { count() };

        let api_version = match unsafe { library.get::<PluginApiVersionFn>(PLUGIN_API_VERSION_SYMBOL) }
        {
            Ok(version_fn) => {
                let ptr = unsafe { version_fn() };
                if ptr.is_null() {
                    None
                } else {
                    // SAFETY: the exported function returns a static NUL-terminated string.
                    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
                }
            }
            Err(_) => None,
        };

        let library = Arc::new(library);
        self.released = Arc::downgrade(&library);
        self.library = Some(library);

        info!(
            "Unit {} opened {} ({} implementation(s), api {:?})",
            self.id,
            image.file_name(),
            implementations,
            api_version
        );

        Ok(ModuleExports {
            implementations,
            api_version,
        })
    }

    fn instantiate(&mut self, index: usize) -> Result<Box<dyn Plugin>, PluginError> {
        let library = self.library()?;
        // SAFETY: symbol type matches `export_plugin!`.
        let create = unsafe { library.get::<PluginCreateFn>(PLUGIN_CREATE_SYMBOL) }
            .map_err(|e| PluginError::InstantiationFailed(e.to_string()))?;

        let raw = unsafe { create(index) };
        if raw.is_null() {
            return Err(PluginError::InstantiationFailed(format!(
                "plugin factory {} returned null",
                index
            )));
        }

        // SAFETY: `export_plugin!` hands out a leaked `Box<Box<dyn Plugin>>`.
        let plugin = unsafe { Box::from_raw(raw as *mut Box<dyn Plugin>) };
        Ok(*plugin)
    }

    fn unload(&mut self) {
        if let Some(library) = self.library.take() {
            match Arc::try_unwrap(library) {
                Ok(library) => {
                    if let Err(e) = library.close() {
                        warn!("Unit {} failed to close library: {}", self.id, e);
                    }
                }
                Err(shared) => {
                    warn!("Unit {} library still referenced at unload", self.id);
                    drop(shared);
                }
            }
        }

        if let Some(staging) = self.staging.take() {
            let path = staging.path().to_path_buf();
            if let Err(e) = staging.close() {
                debug!("Unit {} could not remove staging dir {:?}: {}", self.id, path, e);
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.library.is_some() || self.released.strong_count() > 0
    }
}

impl Drop for NativeUnit {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Creates [`NativeUnit`]s sharing one shared-module list
#[derive(Debug, Clone, Default)]
pub struct NativeUnitFactory {
    shared: NameExclusions,
}

impl NativeUnitFactory {
    pub fn new(shared: NameExclusions) -> Self {
        Self { shared }
    }
}

impl UnitFactory for NativeUnitFactory {
    fn create(&self, module_path: &Path) -> Box<dyn IsolationUnit> {
        Box::new(NativeUnit::new(DependencyResolver::for_module(
            module_path,
            self.shared.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash(b"v1"), content_hash(b"v2"));
    }

    #[tokio::test]
    async fn test_module_image_reads_debug_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("clock.so");
        std::fs::write(&module, b"module-bytes").unwrap();
        std::fs::write(dir.path().join("clock.dbg"), b"symbols").unwrap();

        let image = ModuleImage::read(&module, "dbg").await.unwrap();
        assert_eq!(image.bytes, b"module-bytes");
        assert_eq!(image.hash, content_hash(b"module-bytes"));
        let symbols = image.debug_symbols.unwrap();
        assert_eq!(symbols.file_name, "clock.dbg");
        assert_eq!(symbols.bytes, b"symbols");

        let image = ModuleImage::read(&module, "pdb").await.unwrap();
        assert!(image.debug_symbols.is_none());
    }

    #[test]
    fn test_module_image_missing_file() {
        let err = tokio_test::block_on(ModuleImage::read(Path::new("/no/such/module.so"), "pdb"))
            .unwrap_err();
        assert!(matches!(err, PluginError::Io { .. }));
    }

    #[test]
    fn test_dependency_resolution_prefers_private_copies() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("clock.so");
        let deps = dir.path().join("clock.deps");
        std::fs::create_dir(&deps).unwrap();
        std::fs::write(deps.join("libchrono_helpers.so"), b"private").unwrap();
        std::fs::write(deps.join("libstd-1234.so"), b"shared").unwrap();

        let resolver = DependencyResolver::for_module(&module, NameExclusions::new(["libstd-*"]));
        assert_eq!(resolver.deps_dir(), deps.as_path());
        assert_eq!(
            resolver.resolve("libchrono_helpers.so"),
            DependencySource::Private(deps.join("libchrono_helpers.so"))
        );
        assert_eq!(resolver.resolve("libstd-1234.so"), DependencySource::Shared);
        assert_eq!(resolver.resolve("libmissing.so"), DependencySource::Shared);
        assert_eq!(
            resolver.private_dependencies(),
            vec![deps.join("libchrono_helpers.so")]
        );
    }

    #[test]
    fn test_native_unit_rejects_non_library() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("broken.so");
        let image = ModuleImage {
            path: module.clone(),
            bytes: b"definitely not an object file".to_vec(),
            debug_symbols: None,
            hash: content_hash(b"definitely not an object file"),
        };

        let mut unit = NativeUnitFactory::default().create(&module);
        let err = unit.load(&image).unwrap_err();
        assert!(matches!(err, PluginError::InstantiationFailed(_)));
        assert!(!unit.is_alive());

        unit.unload();
        unit.unload();
        assert!(!unit.is_alive());
    }
}
