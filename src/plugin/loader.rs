//! Module loading backends
//!
//! The isolation boundary never touches the platform loader directly; it goes
//! through [`ModuleLoader`]. Two backends exist:
//!
//! - [`NativeModuleLoader`] loads shared libraries with `libloading`. On unix,
//!   private modules are opened with `RTLD_LOCAL` so their symbols stay inside
//!   the plugin's scope, while shared contract modules are opened with
//!   `RTLD_GLOBAL` so every plugin binds to the host's copy.
//! - [`StaticModuleLoader`] serves modules that are linked into the host
//!   process, keyed by file name. Hosts that bundle plugins statically use it,
//!   and so do the tests.
//!
//! # Plugin Naming Convention
//!
//! Private dependencies named in a manifest resolve to the platform file name
//! for that library inside the plugin directory:
//! - Linux: `lib<name>.so`
//! - macOS: `lib<name>.dylib`
//! - Windows: `<name>.dll`

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lcd_plugin_api::{ENTRY_SYMBOL, PluginEntryFn};
use parking_lot::RwLock;

use super::boundary::BoundaryError;

/// A loaded module.
///
/// Dropping the last reference unloads a native library.
pub struct Module {
    name: String,
    path: Option<PathBuf>,
    inner: ModuleInner,
}

enum ModuleInner {
    Native(libloading::Library),
    Static(Option<PluginEntryFn>),
}

impl Module {
    /// Wrap a native library.
    pub fn native(name: impl Into<String>, path: Option<PathBuf>, library: libloading::Library) -> Self {
        Self {
            name: name.into(),
            path,
            inner: ModuleInner::Native(library),
        }
    }

    /// Wrap an in-process module.
    pub fn in_process(name: impl Into<String>, entry: Option<PluginEntryFn>) -> Self {
        Self {
            name: name.into(),
            path: None,
            inner: ModuleInner::Static(entry),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// File the module was loaded from; `None` for in-process modules and the host image.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_native(&self) -> bool {
        matches!(self.inner, ModuleInner::Native(_))
    }

    /// Look up the plugin entry symbol.
    ///
    /// The returned function pointer is only valid while this module is alive.
    pub fn entry(&self) -> Result<PluginEntryFn, BoundaryError> {
        match &self.inner {
            ModuleInner::Native(library) => {
                // SAFETY: the symbol type is fixed by the plugin contract; a
                // module exporting a different signature violates it.
                let symbol = unsafe { library.get::<PluginEntryFn>(ENTRY_SYMBOL) };
                symbol.map(|s| *s).map_err(|e| BoundaryError::EntrySymbolMissing {
                    module: self.name.clone(),
                    reason: e.to_string(),
                })
            }
            ModuleInner::Static(entry) => entry.ok_or_else(|| BoundaryError::EntrySymbolMissing {
                module: self.name.clone(),
                reason: "module has no entry function".to_string(),
            }),
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("native", &self.is_native())
            .finish()
    }
}

/// Platform file name of a library, e.g. `libfoo.so` for `foo`.
///
/// Names that already carry an extension are returned unchanged.
pub fn library_file_name(name: &str) -> OsString {
    if Path::new(name).extension().is_some() {
        OsString::from(name)
    } else {
        libloading::library_filename(name)
    }
}

/// Backend that turns module files into [`Module`]s.
pub trait ModuleLoader: Send + Sync {
    /// Load a module into a private scope.
    fn load_private(&self, path: &Path) -> Result<Module, BoundaryError>;

    /// Load a shared contract module into the host scope.
    ///
    /// `path` is `None` when no standalone file exists and the module is
    /// linked into the host process image.
    fn load_shared(&self, name: &str, path: Option<&Path>) -> Result<Module, BoundaryError>;

    /// Whether a module file exists for `path`.
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Loads shared libraries from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeModuleLoader;

impl NativeModuleLoader {
    pub fn new() -> Self {
        Self
    }

    #[cfg(unix)]
    fn open(path: &Path, global: bool) -> Result<libloading::Library, libloading::Error> {
        use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_LOCAL, RTLD_NOW};
        let scope = if global { RTLD_GLOBAL } else { RTLD_LOCAL };
        // SAFETY: running library initializers is inherent to loading a plugin.
        unsafe { Library::open(Some(path), RTLD_NOW | scope) }.map(Into::into)
    }

    #[cfg(not(unix))]
    fn open(path: &Path, _global: bool) -> Result<libloading::Library, libloading::Error> {
        // SAFETY: running library initializers is inherent to loading a plugin.
        unsafe { libloading::Library::new(path) }
    }

    #[cfg(unix)]
    fn host_image() -> Result<libloading::Library, libloading::Error> {
        Ok(libloading::os::unix::Library::this().into())
    }

    #[cfg(windows)]
    fn host_image() -> Result<libloading::Library, libloading::Error> {
        libloading::os::windows::Library::this().map(Into::into)
    }
}

impl ModuleLoader for NativeModuleLoader {
    fn load_private(&self, path: &Path) -> Result<Module, BoundaryError> {
        if !path.is_file() {
            return Err(BoundaryError::NotFound {
                name: display_name(path),
                searched: path.to_path_buf(),
            });
        }
        tracing::debug!(path = %path.display(), "Loading private module");
        let library = Self::open(path, false).map_err(|e| BoundaryError::LoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Module::native(display_name(path), Some(path.to_path_buf()), library))
    }

    fn load_shared(&self, name: &str, path: Option<&Path>) -> Result<Module, BoundaryError> {
        match path {
            Some(path) => {
                tracing::debug!(module = %name, path = %path.display(), "Loading shared module");
                let library = Self::open(path, true).map_err(|e| BoundaryError::LoadFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                Ok(Module::native(name, Some(path.to_path_buf()), library))
            }
            None => {
                tracing::debug!(module = %name, "Shared module is linked into the host image");
                let library = Self::host_image().map_err(|e| BoundaryError::LoadFailed {
                    path: PathBuf::from("<host>"),
                    reason: e.to_string(),
                })?;
                Ok(Module::native(name, None, library))
            }
        }
    }
}

/// Serves in-process modules registered by file name.
///
/// Lookups compare file names case-insensitively and ignore the directory,
/// so a catalog entry `plugins/clock/libclock.so` resolves to the module
/// registered as `libclock.so`.
#[derive(Clone, Default)]
pub struct StaticModuleLoader {
    modules: Arc<RwLock<HashMap<String, Option<PluginEntryFn>>>>,
    private_loads: Arc<AtomicUsize>,
    shared_loads: Arc<AtomicUsize>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module that exports an entry function.
    pub fn register(&self, file_name: &str, entry: PluginEntryFn) -> &Self {
        self.modules.write().insert(file_name.to_lowercase(), Some(entry));
        self
    }

    /// Register a module without an entry function (a plain dependency).
    pub fn register_library(&self, file_name: &str) -> &Self {
        self.modules.write().insert(file_name.to_lowercase(), None);
        self
    }

    /// Number of private loads performed.
    pub fn private_loads(&self) -> usize {
        self.private_loads.load(Ordering::SeqCst)
    }

    /// Number of shared loads performed.
    pub fn shared_loads(&self) -> usize {
        self.shared_loads.load(Ordering::SeqCst)
    }

    fn lookup(&self, path: &Path) -> Option<Option<PluginEntryFn>> {
        let key = path.file_name()?.to_string_lossy().to_lowercase();
        self.modules.read().get(&key).copied()
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load_private(&self, path: &Path) -> Result<Module, BoundaryError> {
        let entry = self.lookup(path).ok_or_else(|| BoundaryError::NotFound {
            name: display_name(path),
            searched: path.to_path_buf(),
        })?;
        self.private_loads.fetch_add(1, Ordering::SeqCst);
        Ok(Module::in_process(display_name(path), entry))
    }

    fn load_shared(&self, name: &str, _path: Option<&Path>) -> Result<Module, BoundaryError> {
        self.shared_loads.fetch_add(1, Ordering::SeqCst);
        Ok(Module::in_process(name, None))
    }

    fn exists(&self, path: &Path) -> bool {
        self.lookup(path).is_some()
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
