//! Isolation Boundary
//!
//! Each loaded plugin gets a private resolution scope. Modules the plugin
//! brings along resolve from its own directory and are loaded privately,
//! while a fixed set of shared contract modules always resolve to the single
//! copy loaded into the host scope. A contract type must never be loaded
//! twice: a value built against a second copy is a different type on the
//! host side even though the code is byte-identical.
//!
//! # Safety
//!
//! Unloading frees code. Every object created by the plugin (its instance,
//! drivers, panels, simulator handlers) must be dropped before the private
//! modules of its boundary are released. The lifecycle manager enforces this
//! ordering for objects it owns; objects held by callers keep the plugin
//! alive through an `Arc` and release it when they drop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::loader::{Module, ModuleLoader, NativeModuleLoader, library_file_name};

/// Shared contract modules every plugin must bind to the host's copy of.
pub const DEFAULT_SHARED_MODULES: &[&str] = &["lcd_plugin_api", "lcd_host_runtime"];

/// Errors raised while resolving modules inside a boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BoundaryError {
    /// No module file with that name in the plugin scope
    #[error("Module '{name}' not found (searched {dir})", dir = .searched.display())]
    NotFound { name: String, searched: PathBuf },

    /// The file exists but the platform loader refused it
    #[error("Failed to load module {file}: {reason}", file = .path.display())]
    LoadFailed { path: PathBuf, reason: String },

    /// The module does not export the plugin entry symbol
    #[error("Module '{module}' has no plugin entry symbol: {reason}")]
    EntrySymbolMissing { module: String, reason: String },

    /// The boundary was already released
    #[error("Boundary for '{0}' has been released")]
    Released(String),
}

/// Normalize a module name: strip directory and extension (plus the `lib`
/// prefix of a file name), map `-` to `_`, lowercase.
pub fn normalize_module_name(name: &str) -> String {
    let file = Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let stem = match file.split_once('.') {
        Some((stem, _)) => stem.strip_prefix("lib").unwrap_or(stem).to_string(),
        None => file,
    };
    stem.replace('-', "_").to_lowercase()
}

/// Process-scope set of shared contract modules.
///
/// The set is preloaded into the host scope at most once. The "done" flag is
/// checked before the mutex; callers that arrive while the first preload is
/// running block on the mutex and observe its result.
pub struct SharedModules {
    names: Vec<String>,
    search_dir: Option<PathBuf>,
    loader: Arc<dyn ModuleLoader>,
    preloaded: AtomicBool,
    modules: Mutex<HashMap<String, Arc<Module>>>,
    preload_runs: AtomicUsize,
}

impl SharedModules {
    /// Create a shared set.
    ///
    /// `search_dir` is where standalone copies of shared modules are looked
    /// for; a name with no file there resolves to the host process image.
    pub fn new<I, S>(names: I, search_dir: Option<PathBuf>, loader: Arc<dyn ModuleLoader>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for name in names {
            let name = normalize_module_name(name.as_ref());
            if !name.is_empty() && !normalized.contains(&name) {
                normalized.push(name);
            }
        }
        Self {
            names: normalized,
            search_dir,
            loader,
            preloaded: AtomicBool::new(false),
            modules: Mutex::new(HashMap::new()),
            preload_runs: AtomicUsize::new(0),
        }
    }

    /// Default names plus `extra`, searched beside the host binary.
    pub fn with_defaults<S: AsRef<str>>(extra: &[S], loader: Arc<dyn ModuleLoader>) -> Self {
        let names = DEFAULT_SHARED_MODULES
            .iter()
            .map(|s| s.to_string())
            .chain(extra.iter().map(|s| s.as_ref().to_string()));
        let search_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self::new(names, search_dir, loader)
    }

    /// Shared set used by the native runtime of this process.
    pub fn process() -> Arc<SharedModules> {
        static SHARED: OnceLock<Arc<SharedModules>> = OnceLock::new();
        SHARED
            .get_or_init(|| {
                Arc::new(SharedModules::with_defaults::<&str>(
                    &[],
                    Arc::new(NativeModuleLoader::new()),
                ))
            })
            .clone()
    }

    /// Normalized shared names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_shared(&self, name: &str) -> bool {
        let name = normalize_module_name(name);
        self.names.iter().any(|n| *n == name)
    }

    pub fn is_preloaded(&self) -> bool {
        self.preloaded.load(Ordering::Acquire)
    }

    /// How many times the preload actually ran. At most one success per set.
    pub fn preload_runs(&self) -> usize {
        self.preload_runs.load(Ordering::SeqCst)
    }

    /// Load every shared module into the host scope, once.
    pub fn ensure_preloaded(&self) -> Result<(), BoundaryError> {
        if self.preloaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut modules = self.modules.lock();
        if self.preloaded.load(Ordering::Acquire) {
            return Ok(());
        }

        self.preload_runs.fetch_add(1, Ordering::SeqCst);
        for name in &self.names {
            if modules.contains_key(name) {
                continue;
            }
            let module = self.load_one(name)?;
            modules.insert(name.clone(), Arc::new(module));
        }

        self.preloaded.store(true, Ordering::Release);
        tracing::debug!(count = modules.len(), "Shared contract modules preloaded");
        Ok(())
    }

    /// The host copy of a shared module.
    pub fn get(&self, name: &str) -> Result<Arc<Module>, BoundaryError> {
        self.ensure_preloaded()?;
        let key = normalize_module_name(name);
        self.modules
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| BoundaryError::NotFound {
                name: name.to_string(),
                searched: PathBuf::from("<shared>"),
            })
    }

    fn load_one(&self, name: &str) -> Result<Module, BoundaryError> {
        let standalone = self
            .search_dir
            .as_ref()
            .map(|dir| dir.join(library_file_name(name)))
            .filter(|path| self.loader.exists(path));
        self.loader.load_shared(name, standalone.as_deref())
    }
}

impl std::fmt::Debug for SharedModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedModules")
            .field("names", &self.names)
            .field("preloaded", &self.is_preloaded())
            .finish()
    }
}

/// Private resolution scope of one loaded plugin.
pub struct Boundary {
    plugin_id: String,
    plugin_dir: PathBuf,
    entry_path: PathBuf,
    loader: Arc<dyn ModuleLoader>,
    shared: Arc<SharedModules>,
    /// Private modules in load order
    private: Mutex<Vec<(String, Arc<Module>)>>,
    released: AtomicBool,
}

impl Boundary {
    /// Create an empty boundary for a plugin. Nothing is loaded yet.
    pub fn create(
        plugin_id: impl Into<String>,
        plugin_dir: impl Into<PathBuf>,
        entry_path: impl Into<PathBuf>,
        loader: Arc<dyn ModuleLoader>,
        shared: Arc<SharedModules>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin_dir: plugin_dir.into(),
            entry_path: entry_path.into(),
            loader,
            shared,
            private: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Resolve a module by name.
    ///
    /// Shared names go to the host copy; anything else is loaded privately
    /// from the plugin directory and cached for the life of the boundary.
    pub fn resolve_and_load(&self, name: &str) -> Result<Arc<Module>, BoundaryError> {
        if self.released.load(Ordering::Acquire) {
            return Err(BoundaryError::Released(self.plugin_id.clone()));
        }

        if self.shared.is_shared(name) {
            tracing::trace!(plugin_id = %self.plugin_id, module = %name, "Redirecting to shared module");
            return self.shared.get(name);
        }

        let key = normalize_module_name(name);
        if let Some((_, module)) = self.private.lock().iter().find(|(k, _)| *k == key) {
            return Ok(module.clone());
        }

        let path = self.plugin_dir.join(library_file_name(name));
        self.load_private(key, &path)
    }

    /// Load the plugin's entry module privately.
    pub fn load_entry(&self) -> Result<Arc<Module>, BoundaryError> {
        if self.released.load(Ordering::Acquire) {
            return Err(BoundaryError::Released(self.plugin_id.clone()));
        }
        let key = normalize_module_name(&self.entry_path.to_string_lossy());
        if let Some((_, module)) = self.private.lock().iter().find(|(k, _)| *k == key) {
            return Ok(module.clone());
        }
        let path = self.entry_path.clone();
        self.load_private(key, &path)
    }

    fn load_private(&self, key: String, path: &Path) -> Result<Arc<Module>, BoundaryError> {
        let module = Arc::new(self.loader.load_private(path)?);
        tracing::debug!(
            plugin_id = %self.plugin_id,
            path = %path.display(),
            "Loaded private module"
        );
        self.private.lock().push((key, module.clone()));
        Ok(module)
    }

    /// Names of privately loaded modules, in load order.
    pub fn private_modules(&self) -> Vec<String> {
        self.private.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release private modules in reverse load order.
    ///
    /// Best-effort: a module still referenced elsewhere is freed when its
    /// last reference drops. Calling this twice is a no-op.
    pub fn unload(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut private = std::mem::take(&mut *self.private.lock());
        let count = private.len();
        while let Some((name, module)) = private.pop() {
            if Arc::strong_count(&module) > 1 {
                tracing::debug!(
                    plugin_id = %self.plugin_id,
                    module = %name,
                    "Module still referenced, deferring release"
                );
            }
            drop(module);
        }
        tracing::debug!(plugin_id = %self.plugin_id, modules = count, "Boundary released");
    }
}

impl Drop for Boundary {
    fn drop(&mut self) {
        self.unload();
    }
}

impl std::fmt::Debug for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Boundary")
            .field("plugin_id", &self.plugin_id)
            .field("plugin_dir", &self.plugin_dir)
            .field("private", &self.private_modules())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::loader::StaticModuleLoader;
    use lcd_plugin_api::PluginModule;

    extern "C" fn empty_entry() -> PluginModule {
        PluginModule::new(Vec::new())
    }

    fn setup() -> (StaticModuleLoader, Arc<SharedModules>) {
        let loader = StaticModuleLoader::new();
        let shared = Arc::new(SharedModules::new(
            DEFAULT_SHARED_MODULES.iter().copied(),
            None,
            Arc::new(loader.clone()),
        ));
        (loader, shared)
    }

    #[test]
    fn test_normalize_module_name() {
        assert_eq!(normalize_module_name("liblcd_plugin_api.so"), "lcd_plugin_api");
        assert_eq!(normalize_module_name("lcd-plugin-api"), "lcd_plugin_api");
        assert_eq!(normalize_module_name("/x/y/LCD_Plugin_Api.dll"), "lcd_plugin_api");
        assert_eq!(normalize_module_name("codec"), "codec");
    }

    #[test]
    fn test_shared_names_resolve_to_host_copy() {
        let (loader, shared) = setup();
        let a = Boundary::create("a", "/plugins/a", "/plugins/a/liba.so", Arc::new(loader.clone()), shared.clone());
        let b = Boundary::create("b", "/plugins/b", "/plugins/b/libb.so", Arc::new(loader.clone()), shared.clone());

        let from_a = a.resolve_and_load("lcd_plugin_api").unwrap();
        let from_b = b.resolve_and_load("liblcd-plugin-api.so").unwrap();
        assert!(Arc::ptr_eq(&from_a, &from_b));
        assert!(a.private_modules().is_empty());
        assert_eq!(loader.shared_loads(), DEFAULT_SHARED_MODULES.len());
        assert_eq!(shared.preload_runs(), 1);
    }

    #[test]
    fn test_preload_runs_once_under_contention() {
        let (loader, shared) = setup();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let shared = shared.clone();
                scope.spawn(move || shared.ensure_preloaded().unwrap());
            }
        });
        assert_eq!(shared.preload_runs(), 1);
        assert_eq!(loader.shared_loads(), DEFAULT_SHARED_MODULES.len());
    }

    #[test]
    fn test_private_modules_cached_and_released() {
        let (loader, shared) = setup();
        loader.register("libclock.so", empty_entry);
        loader.register_library(&library_file_name("fonts").to_string_lossy());

        let boundary = Boundary::create(
            "clock",
            "/plugins/clock",
            "/plugins/clock/libclock.so",
            Arc::new(loader.clone()),
            shared,
        );
        boundary.resolve_and_load("fonts").unwrap();
        boundary.resolve_and_load("fonts").unwrap();
        boundary.load_entry().unwrap();
        assert_eq!(boundary.private_modules(), vec!["fonts".to_string(), "clock".to_string()]);
        assert_eq!(loader.private_loads(), 2);

        boundary.unload();
        assert!(boundary.is_released());
        assert!(boundary.private_modules().is_empty());
        assert!(matches!(boundary.resolve_and_load("fonts"), Err(BoundaryError::Released(_))));
        boundary.unload();
    }

    #[test]
    fn test_missing_private_module() {
        let (loader, shared) = setup();
        let boundary = Boundary::create("x", "/plugins/x", "/plugins/x/libx.so", Arc::new(loader), shared);
        assert!(matches!(boundary.resolve_and_load("nope"), Err(BoundaryError::NotFound { .. })));
        assert!(matches!(boundary.load_entry(), Err(BoundaryError::NotFound { .. })));
    }
}
