//! Plugin Lifecycle Management
//!
//! Turns a catalog entry into a running plugin instance and back.
//!
//! # Lifecycle State Machine
//!
//! ```text
//!     +-------------+
//!     | Discovered  | <---------------------+
//!     +------+------+                       |
//!            | load                         | failure / unload
//!            v                              |
//!     +------+------+                       |
//!     |   Loading   |  boundary, entry,     |
//!     +------+------+  construct, init -----+
//!            |
//!            v
//!     +------+------+
//!     |   Active    |  LoadedPlugin attached
//!     +-------------+
//! ```
//!
//! Each catalog entry owns a [`PluginSlot`]. The slot is the only place a
//! [`LoadedPlugin`] is attached, and its mutex guards every transition.
//! While a load is in flight the slot holds a shared future, so concurrent
//! callers for the same id await the same outcome and initialization runs
//! once per load cycle.
//!
//! A load that exceeds the configured timeout fails its callers at once, but
//! the slot stays Loading until the blocking work returns, so a retry never
//! overlaps it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use lcd_plugin_api::{ABI_VERSION_MAJOR, ABI_VERSION_MINOR, AbiVersion, PluginExport, PluginInstance, PluginKind};
use parking_lot::Mutex;

use super::boundary::{Boundary, BoundaryError, SharedModules};
use super::catalog::CatalogEntry;
use super::context::{HostContext, HostServices};
use super::isolation::{call_plugin_safely, call_plugin_safely_value, from_ffi};
use super::loader::ModuleLoader;
use super::manifest::version_satisfies;

/// Plugin lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Cataloged, no instance
    Discovered,
    /// Load in progress
    Loading,
    /// Instance attached
    Active,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::Discovered => write!(f, "discovered"),
            PluginState::Loading => write!(f, "loading"),
            PluginState::Active => write!(f, "active"),
        }
    }
}

/// Typed reason a load failed.
///
/// Cloneable because every caller awaiting the same in-flight load receives
/// the same failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadFailure {
    #[error("Plugin manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("Plugin module not found: {0}")]
    ModuleNotFound(String),

    #[error("Plugin entry point not found: {0}")]
    EntryPointNotFound(String),

    #[error("Plugin construction failed: {0}")]
    ConstructionFailed(String),

    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Plugin version incompatible: {0}")]
    VersionIncompatible(String),

    #[error("Plugin not discovered: {0}")]
    NotDiscovered(String),
}

impl LoadFailure {
    /// Short reason tag for logs.
    pub fn reason(&self) -> &'static str {
        match self {
            LoadFailure::ManifestInvalid(_) => "manifest_invalid",
            LoadFailure::ModuleNotFound(_) => "module_not_found",
            LoadFailure::EntryPointNotFound(_) => "entry_point_not_found",
            LoadFailure::ConstructionFailed(_) => "construction_failed",
            LoadFailure::InitializationFailed(_) => "initialization_failed",
            LoadFailure::VersionIncompatible(_) => "version_incompatible",
            LoadFailure::NotDiscovered(_) => "not_discovered",
        }
    }
}

impl From<BoundaryError> for LoadFailure {
    fn from(err: BoundaryError) -> Self {
        match err {
            BoundaryError::EntrySymbolMissing { .. } => LoadFailure::EntryPointNotFound(err.to_string()),
            BoundaryError::NotFound { .. } | BoundaryError::LoadFailed { .. } | BoundaryError::Released(_) => {
                LoadFailure::ModuleNotFound(err.to_string())
            }
        }
    }
}

/// Call statistics of a loaded plugin.
#[derive(Debug, Clone)]
pub struct CallStats {
    /// Time when the plugin was last active
    pub last_active: Instant,

    /// Number of times the plugin has been called
    pub call_count: u64,

    /// Number of errors encountered
    pub error_count: u64,

    /// Last error message (if any)
    pub last_error: Option<String>,
}

impl CallStats {
    fn new() -> Self {
        Self {
            last_active: Instant::now(),
            call_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        self.last_active = Instant::now();
        self.call_count += 1;
    }

    /// Record an error
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_active = Instant::now();
        self.call_count += 1;
        self.error_count += 1;
        self.last_error = Some(error.into());
    }
}

/// A constructed and initialized plugin.
///
/// Field order is drop order: the instance goes first, then the host context
/// its callbacks point at, then the boundary holding the module code.
pub struct LoadedPlugin {
    instance: Mutex<PluginInstance>,
    host: Arc<HostContext>,
    boundary: Boundary,
    plugin_id: String,
    kind: PluginKind,
    name: String,
    version: String,
    loaded_at: Instant,
    torn_down: AtomicBool,
    stats: Mutex<CallStats>,
}

impl LoadedPlugin {
    /// Catalog id this plugin was created from.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Name reported by the instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version reported by the instance.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn uptime(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    pub fn stats(&self) -> CallStats {
        self.stats.lock().clone()
    }

    /// Names of the modules loaded privately for this plugin.
    pub fn private_modules(&self) -> Vec<String> {
        self.boundary.private_modules()
    }

    pub fn host_context(&self) -> &HostContext {
        &self.host
    }

    /// Run `f` with exclusive access to the instance.
    pub(crate) fn with_instance<R>(&self, f: impl FnOnce(&mut PluginInstance) -> R) -> R {
        let mut instance = self.instance.lock();
        f(&mut instance)
    }

    pub(crate) fn record_success(&self) {
        self.stats.lock().record_success();
    }

    pub(crate) fn record_error(&self, error: impl Into<String>) {
        self.stats.lock().record_error(error);
    }

    /// Run the plugin's teardown once. Errors and panics are logged and swallowed.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let result = self.with_instance(|instance| {
            let teardown = instance.common.teardown;
            call_plugin_safely(AssertUnwindSafe(|| from_ffi(teardown(&mut instance.handle))))
        });
        match result {
            Ok(()) => tracing::debug!(plugin_id = %self.plugin_id, "Plugin teardown completed"),
            Err(e) => tracing::warn!(plugin_id = %self.plugin_id, error = %e, "Plugin teardown failed, continuing"),
        }
    }

    /// Drop the instance and release the boundary.
    pub fn release(self) {
        let plugin_id = self.plugin_id.clone();
        drop(self);
        tracing::debug!(plugin_id = %plugin_id, "Plugin released");
    }
}

impl Drop for LoadedPlugin {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("plugin_id", &self.plugin_id)
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("boundary", &self.boundary)
            .finish()
    }
}

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<LoadedPlugin>, LoadFailure>>>;
type SettleFuture = Shared<BoxFuture<'static, ()>>;

enum SlotState {
    Discovered,
    Loading { generation: u64, future: LoadFuture },
    /// A load timed out but its blocking task is still running.
    Settling { failure: LoadFailure, settled: SettleFuture },
    Active(Arc<LoadedPlugin>),
}

/// Attachment point for at most one live plugin.
pub struct PluginSlot {
    plugin_id: String,
    state: Mutex<SlotState>,
    generation: AtomicU64,
    load_count: AtomicU64,
    last_failure: Mutex<Option<LoadFailure>>,
}

impl PluginSlot {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            state: Mutex::new(SlotState::Discovered),
            generation: AtomicU64::new(0),
            load_count: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn state(&self) -> PluginState {
        match &*self.state.lock() {
            SlotState::Discovered => PluginState::Discovered,
            SlotState::Loading { .. } | SlotState::Settling { .. } => PluginState::Loading,
            SlotState::Active(_) => PluginState::Active,
        }
    }

    /// The attached plugin, if Active.
    pub fn active(&self) -> Option<Arc<LoadedPlugin>> {
        match &*self.state.lock() {
            SlotState::Active(plugin) => Some(plugin.clone()),
            _ => None,
        }
    }

    /// Successful loads over the life of this slot.
    pub fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Failure of the most recent load attempt, cleared on success.
    pub fn last_failure(&self) -> Option<LoadFailure> {
        self.last_failure.lock().clone()
    }

    fn finish_load(&self, generation: u64, result: &Result<Arc<LoadedPlugin>, LoadFailure>) {
        let mut state = self.state.lock();
        let current = matches!(&*state, SlotState::Loading { generation: g, .. } if *g == generation);
        if !current {
            return;
        }
        match result {
            Ok(plugin) => {
                *state = SlotState::Active(plugin.clone());
                self.load_count.fetch_add(1, Ordering::SeqCst);
                *self.last_failure.lock() = None;
                tracing::info!(
                    plugin_id = %self.plugin_id,
                    version = %plugin.version(),
                    "Plugin loaded"
                );
            }
            Err(failure) => {
                *state = SlotState::Discovered;
                *self.last_failure.lock() = Some(failure.clone());
                tracing::warn!(
                    plugin_id = %self.plugin_id,
                    reason = failure.reason(),
                    error = %failure,
                    "Plugin load failed"
                );
            }
        }
    }

    /// Park a timed-out load until its blocking task returns.
    ///
    /// The slot reports Loading and refuses new loads until then; a late
    /// success is torn down rather than attached.
    fn begin_settling(
        self: &Arc<Self>,
        generation: u64,
        failure: &LoadFailure,
        task: tokio::task::JoinHandle<Result<LoadedPlugin, LoadFailure>>,
    ) {
        let slot = self.clone();
        let settled = async move {
            match task.await {
                Ok(Ok(plugin)) => {
                    tracing::warn!(
                        plugin_id = %slot.plugin_id,
                        "Plugin finished loading after its timeout, tearing it down"
                    );
                    dispose(Arc::new(plugin)).await;
                }
                Ok(Err(failure)) => tracing::debug!(
                    plugin_id = %slot.plugin_id,
                    error = %failure,
                    "Timed-out plugin load failed"
                ),
                Err(e) => tracing::warn!(plugin_id = %slot.plugin_id, error = %e, "Timed-out load task aborted"),
            }
            let mut state = slot.state.lock();
            if matches!(&*state, SlotState::Settling { .. }) {
                *state = SlotState::Discovered;
            }
        }
        .boxed()
        .shared();

        {
            let mut state = self.state.lock();
            if matches!(&*state, SlotState::Loading { generation: g, .. } if *g == generation) {
                *state = SlotState::Settling {
                    failure: failure.clone(),
                    settled: settled.clone(),
                };
            }
        }
        *self.last_failure.lock() = Some(failure.clone());
        tokio::spawn(settled);
    }
}

impl std::fmt::Debug for PluginSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSlot")
            .field("plugin_id", &self.plugin_id)
            .field("state", &self.state())
            .finish()
    }
}

enum UnloadStep {
    Done,
    Dispose(Arc<LoadedPlugin>),
    Wait(u64, LoadFuture),
    Settle(SettleFuture),
}

/// Loads and unloads plugins of one kind.
#[derive(Clone)]
pub struct LifecycleManager {
    kind: PluginKind,
    runtime_version: semver::Version,
    loader: Arc<dyn ModuleLoader>,
    shared: Arc<SharedModules>,
    services: Arc<HostServices>,
    init_timeout: Option<Duration>,
}

impl LifecycleManager {
    pub fn new(
        kind: PluginKind,
        runtime_version: semver::Version,
        loader: Arc<dyn ModuleLoader>,
        shared: Arc<SharedModules>,
        services: Arc<HostServices>,
    ) -> Self {
        Self {
            kind,
            runtime_version,
            loader,
            shared,
            services,
            init_timeout: None,
        }
    }

    /// Bound the whole load, initialization included. `None` waits forever.
    pub fn with_init_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    pub fn runtime_version(&self) -> &semver::Version {
        &self.runtime_version
    }

    pub fn loader(&self) -> &Arc<dyn ModuleLoader> {
        &self.loader
    }

    /// Load the plugin of `entry`, or return the live instance.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn load(&self, entry: &Arc<CatalogEntry>) -> Result<Arc<LoadedPlugin>, LoadFailure> {
        let slot = entry.slot().clone();
        let (generation, future) = {
            let mut state = slot.state.lock();
            match &*state {
                SlotState::Active(plugin) => return Ok(plugin.clone()),
                SlotState::Loading { generation, future } => (*generation, future.clone()),
                SlotState::Settling { failure, .. } => return Err(failure.clone()),
                SlotState::Discovered => {
                    let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::debug!(plugin_id = %entry.id(), "Plugin state transition: discovered -> loading");
                    let future = self.spawn_load(entry.clone(), generation);
                    *state = SlotState::Loading {
                        generation,
                        future: future.clone(),
                    };
                    (generation, future)
                }
            }
        };

        let result = future.await;
        slot.finish_load(generation, &result);
        result
    }

    /// Tear down and detach the plugin of `slot`.
    ///
    /// Waits for an in-flight load first. Returns `false` if nothing was loaded.
    pub async fn unload(&self, slot: &PluginSlot) -> bool {
        loop {
            let step = {
                let mut state = slot.state.lock();
                match std::mem::replace(&mut *state, SlotState::Discovered) {
                    SlotState::Discovered => UnloadStep::Done,
                    SlotState::Active(plugin) => UnloadStep::Dispose(plugin),
                    SlotState::Loading { generation, future } => {
                        *state = SlotState::Loading {
                            generation,
                            future: future.clone(),
                        };
                        UnloadStep::Wait(generation, future)
                    }
                    SlotState::Settling { failure, settled } => {
                        *state = SlotState::Settling {
                            failure,
                            settled: settled.clone(),
                        };
                        UnloadStep::Settle(settled)
                    }
                }
            };

            match step {
                UnloadStep::Done => return false,
                UnloadStep::Dispose(plugin) => {
                    dispose(plugin).await;
                    return true;
                }
                UnloadStep::Wait(generation, future) => {
                    let result = future.await;
                    slot.finish_load(generation, &result);
                }
                UnloadStep::Settle(settled) => settled.await,
            }
        }
    }

    fn spawn_load(&self, entry: Arc<CatalogEntry>, generation: u64) -> LoadFuture {
        let manager = self.clone();
        let timeout = self.init_timeout;
        let slot = entry.slot().clone();
        let mut task = tokio::task::spawn_blocking(move || manager.load_blocking(&entry));

        async move {
            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        let failure = LoadFailure::InitializationFailed(format!(
                            "timed out after {}ms",
                            limit.as_millis()
                        ));
                        slot.begin_settling(generation, &failure, task);
                        return Err(failure);
                    }
                },
                None => task.await,
            };
            match joined {
                Ok(result) => result.map(Arc::new),
                Err(e) => Err(LoadFailure::ConstructionFailed(format!("load task aborted: {e}"))),
            }
        }
        .boxed()
        .shared()
    }

    /// The blocking part of a load. Any early return drops the partially
    /// built boundary, which releases whatever it loaded.
    fn load_blocking(&self, entry: &CatalogEntry) -> Result<LoadedPlugin, LoadFailure> {
        let manifest = entry.manifest();
        if manifest.kind != self.kind {
            return Err(LoadFailure::ManifestInvalid(format!(
                "plugin kind is {}, runtime expects {}",
                manifest.kind, self.kind
            )));
        }
        if !version_satisfies(&manifest.minimum_runtime_version, &self.runtime_version) {
            return Err(LoadFailure::VersionIncompatible(format!(
                "requires runtime {}, running {}",
                manifest.minimum_runtime_version, self.runtime_version
            )));
        }

        let boundary = Boundary::create(
            entry.id(),
            entry.dir(),
            entry.entry_path(),
            self.loader.clone(),
            self.shared.clone(),
        );
        self.shared.ensure_preloaded()?;
        for dependency in &manifest.dependencies {
            boundary.resolve_and_load(dependency)?;
        }

        let module = boundary.load_entry()?;
        let entry_fn = module.entry()?;
        let plugin_module = call_plugin_safely_value(|| entry_fn())
            .map_err(|e| LoadFailure::ConstructionFailed(e.to_string()))?;
        check_abi(plugin_module.abi_version)?;

        let exports: Vec<PluginExport> = plugin_module.exports_of(self.kind).copied().collect();
        let export = match exports.as_slice() {
            [export] => *export,
            [] => {
                return Err(LoadFailure::EntryPointNotFound(format!(
                    "module exports no {} plugin",
                    self.kind
                )));
            }
            many => {
                return Err(LoadFailure::EntryPointNotFound(format!(
                    "module exports {} {} plugins, expected exactly one",
                    many.len(),
                    self.kind
                )));
            }
        };

        // Declared before the instance so it is dropped after it on every path.
        let host = Arc::new(HostContext::new(
            entry.id(),
            entry.dir(),
            self.runtime_version.clone(),
            self.services.clone(),
        ));
        let mut instance = call_plugin_safely(|| from_ffi((export.create)()))
            .map_err(|e| LoadFailure::ConstructionFailed(e.to_string()))?;
        if instance.kind() != Some(self.kind) {
            return Err(LoadFailure::ConstructionFailed(format!(
                "instance does not provide the {} interface",
                self.kind
            )));
        }
        if !instance.info.id.as_str().eq_ignore_ascii_case(entry.id()) {
            tracing::warn!(
                plugin_id = %entry.id(),
                reported = %instance.info.id,
                "Plugin instance reports a different id than its manifest"
            );
        }

        let context = host.ffi_context();
        let initialize = instance.common.initialize;
        call_plugin_safely(AssertUnwindSafe(|| from_ffi(initialize(&mut instance.handle, context.as_ffi()))))
            .map_err(|e| LoadFailure::InitializationFailed(e.to_string()))?;
        drop(context);

        let name = instance.info.name.to_string();
        let version = instance.info.version.to_string();
        Ok(LoadedPlugin {
            instance: Mutex::new(instance),
            host,
            boundary,
            plugin_id: entry.id().to_string(),
            kind: self.kind,
            name,
            version,
            loaded_at: Instant::now(),
            torn_down: AtomicBool::new(false),
            stats: Mutex::new(CallStats::new()),
        })
    }
}

fn check_abi(version: AbiVersion) -> Result<(), LoadFailure> {
    if version.major != ABI_VERSION_MAJOR || version.minor > ABI_VERSION_MINOR {
        return Err(LoadFailure::VersionIncompatible(format!(
            "plugin ABI {}.{}, host ABI {}.{}",
            version.major, version.minor, ABI_VERSION_MAJOR, ABI_VERSION_MINOR
        )));
    }
    Ok(())
}

async fn dispose(plugin: Arc<LoadedPlugin>) {
    let plugin_id = plugin.plugin_id().to_string();
    let released = tokio::task::spawn_blocking(move || {
        plugin.teardown();
        match Arc::try_unwrap(plugin) {
            Ok(plugin) => {
                plugin.release();
                true
            }
            Err(_) => false,
        }
    })
    .await;

    match released {
        Ok(true) => tracing::info!(plugin_id = %plugin_id, "Plugin unloaded"),
        Ok(false) => tracing::info!(
            plugin_id = %plugin_id,
            "Plugin unloaded; outstanding handles keep its modules mapped until dropped"
        ),
        Err(e) => tracing::warn!(plugin_id = %plugin_id, error = %e, "Plugin teardown task failed"),
    }
}
