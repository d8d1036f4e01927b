//! Runtime facade
//!
//! One [`PluginRuntime`] exists per plugin kind. It owns the search paths,
//! the current catalog and routing table, and the lifecycle manager, and it
//! is the only thing the rest of the host talks to.
//!
//! # Usage
//!
//! ```ignore
//! use lcd_host::plugin::prelude::*;
//!
//! let panels = PanelRuntime::builder().build();
//! let report = panels.discover();
//! println!("{} panel plugins", report.plugin_count());
//!
//! let request = PanelRequest::new(480, 480);
//! if let Some(mut panel) = panels.create_panel("video:clips/intro.mp4", &request).await {
//!     let frame = panel.render(480, 480)?;
//! }
//! ```
//!
//! Catalog and routes are published together through an `ArcSwap`, so a
//! lookup always sees one consistent discovery pass. Discovery itself is
//! serialized by a mutex.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use lcd_plugin_api::{
    DevicePluginVTable, HardwareDescriptor, NetworkEndpoint, PanelCreationContext, PanelPluginVTable,
    PanelTypeInfo, PluginInstance, PluginKind, ROption, RString, SemVer,
};
use parking_lot::Mutex;

use super::adapters::{DriverHandle, PanelHandle, SimulatorHandle, TransportProvider, device_opener};
use super::boundary::SharedModules;
use super::catalog::{Catalog, CatalogEntry, Diagnostic};
use super::context::HostServices;
use super::isolation::{PluginError, call_plugin_safely, from_ffi};
use super::lifecycle::{CallStats, LifecycleManager, LoadFailure, LoadedPlugin, PluginSlot, PluginState};
use super::loader::{ModuleLoader, NativeModuleLoader};
use super::manifest::{DeviceCapability, PanelTypeCapability, ProtocolCapability};
use super::routing::{CapabilityKey, ResolvedPanel, RoutingTable};
use super::search_paths::{PluginOrigin, SearchPath, resolve_search_paths};

/// Plugin kind a runtime is parameterized over.
pub trait RuntimeKind: Send + Sync + 'static {
    const KIND: PluginKind;
}

/// Marker for the device driver runtime.
#[derive(Debug, Clone, Copy)]
pub struct Device;

/// Marker for the display panel runtime.
#[derive(Debug, Clone, Copy)]
pub struct Panel;

impl RuntimeKind for Device {
    const KIND: PluginKind = PluginKind::Device;
}

impl RuntimeKind for Panel {
    const KIND: PluginKind = PluginKind::Panel;
}

pub type DeviceRuntime = PluginRuntime<Device>;
pub type PanelRuntime = PluginRuntime<Panel>;

/// Version of the plugin SDK this host implements.
pub fn sdk_version() -> semver::Version {
    let SemVer { major, minor, patch } = SemVer::sdk();
    semver::Version::new(u64::from(major), u64::from(minor), u64::from(patch))
}

/// Catalog, routes and diagnostics of one discovery pass.
#[derive(Debug)]
pub struct RuntimeSnapshot {
    catalog: Catalog,
    routes: RoutingTable,
    diagnostics: Vec<Diagnostic>,
}

impl RuntimeSnapshot {
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

/// One plugin found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPlugin {
    pub id: String,
    pub name: String,
    pub version: semver::Version,
    pub origin: PluginOrigin,
    pub dir: PathBuf,
    pub capability_count: usize,
}

/// Result of [`PluginRuntime::discover`].
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub plugins: Vec<DiscoveredPlugin>,
    pub diagnostics: Vec<Diagnostic>,
}

impl DiscoveryReport {
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Capability count for a plugin id.
    pub fn capability_count(&self, plugin_id: &str) -> Option<usize> {
        self.plugins
            .iter()
            .find(|p| p.id.eq_ignore_ascii_case(plugin_id))
            .map(|p| p.capability_count)
    }
}

/// Point-in-time view of one cataloged plugin.
#[derive(Debug, Clone)]
pub struct PluginStatus {
    pub id: String,
    pub name: String,
    pub version: semver::Version,
    pub origin: PluginOrigin,
    pub dir: PathBuf,
    pub state: PluginState,
    pub load_count: u64,
    pub last_failure: Option<LoadFailure>,
    /// Present while Active
    pub stats: Option<CallStats>,
    pub uptime: Option<Duration>,
    pub private_modules: Vec<String>,
}

/// Size and settings for a new panel.
#[derive(Debug, Clone)]
pub struct PanelRequest {
    pub width: u32,
    pub height: u32,
    pub settings: serde_json::Value,
}

impl PanelRequest {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            settings: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }
}

/// Builder for [`PluginRuntime`].
pub struct RuntimeBuilder<K> {
    search_paths: Option<Vec<SearchPath>>,
    runtime_version: semver::Version,
    loader: Option<Arc<dyn ModuleLoader>>,
    shared: Option<Arc<SharedModules>>,
    services: Option<Arc<HostServices>>,
    init_timeout: Option<Duration>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: RuntimeKind> RuntimeBuilder<K> {
    fn new() -> Self {
        Self {
            search_paths: None,
            runtime_version: sdk_version(),
            loader: None,
            shared: None,
            services: None,
            init_timeout: None,
            _kind: PhantomData,
        }
    }

    /// Replace the platform search paths.
    pub fn search_paths(mut self, paths: Vec<SearchPath>) -> Self {
        self.search_paths = Some(paths);
        self
    }

    /// Version compared against `minimumSdkVersion` and handed to plugins.
    pub fn runtime_version(mut self, version: semver::Version) -> Self {
        self.runtime_version = version;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn shared_modules(mut self, shared: Arc<SharedModules>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn services(mut self, services: Arc<HostServices>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn init_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn build(self) -> PluginRuntime<K> {
        let shared = match (&self.shared, &self.loader) {
            (Some(shared), _) => shared.clone(),
            (None, Some(loader)) => Arc::new(SharedModules::with_defaults::<&str>(&[], loader.clone())),
            (None, None) => SharedModules::process(),
        };
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(NativeModuleLoader::new()) as Arc<dyn ModuleLoader>);
        let services = self.services.unwrap_or_default();
        let search_paths = self
            .search_paths
            .unwrap_or_else(|| resolve_search_paths(None, None, &[]));

        let lifecycle = LifecycleManager::new(K::KIND, self.runtime_version, loader, shared, services)
            .with_init_timeout(self.init_timeout);

        PluginRuntime {
            lifecycle,
            search_paths,
            state: ArcSwap::from_pointee(RuntimeSnapshot {
                catalog: Catalog::empty(K::KIND),
                routes: RoutingTable::default(),
                diagnostics: Vec::new(),
            }),
            discovery: Mutex::new(()),
            detached: Mutex::new(Vec::new()),
            _kind: PhantomData,
        }
    }
}

/// Plugin runtime for one kind.
pub struct PluginRuntime<K> {
    lifecycle: LifecycleManager,
    search_paths: Vec<SearchPath>,
    state: ArcSwap<RuntimeSnapshot>,
    discovery: Mutex<()>,
    /// Live slots whose id left the catalog on rediscovery
    detached: Mutex<Vec<Arc<PluginSlot>>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: RuntimeKind> PluginRuntime<K> {
    pub fn builder() -> RuntimeBuilder<K> {
        RuntimeBuilder::new()
    }

    pub fn kind(&self) -> PluginKind {
        K::KIND
    }

    pub fn runtime_version(&self) -> &semver::Version {
        self.lifecycle.runtime_version()
    }

    pub fn search_paths(&self) -> &[SearchPath] {
        &self.search_paths
    }

    /// Current catalog, routes and diagnostics.
    pub fn snapshot(&self) -> Arc<RuntimeSnapshot> {
        self.state.load_full()
    }

    /// Scan the search paths and publish a new catalog and routing table.
    ///
    /// Plugins that are already Active stay attached to their id.
    pub fn discover(&self) -> DiscoveryReport {
        let _guard = self.discovery.lock();

        let outcome = Catalog::scan(
            K::KIND,
            &self.search_paths,
            self.lifecycle.runtime_version(),
            self.lifecycle.loader().as_ref(),
        );
        let mut catalog = outcome.catalog;
        let previous = self.state.load_full();
        let orphaned = catalog.adopt_slots(&previous.catalog);
        self.park(orphaned);

        let plugins: Vec<DiscoveredPlugin> = catalog
            .entries()
            .iter()
            .map(|entry| {
                let manifest = entry.manifest();
                DiscoveredPlugin {
                    id: manifest.id.clone(),
                    name: manifest.name.clone(),
                    version: manifest.version.clone(),
                    origin: entry.origin(),
                    dir: entry.dir().to_path_buf(),
                    capability_count: manifest.capability_count(),
                }
            })
            .collect();
        for plugin in &plugins {
            tracing::info!(
                kind = %K::KIND,
                plugin_id = %plugin.id,
                origin = %plugin.origin,
                capabilities = plugin.capability_count,
                "Discovered plugin"
            );
        }

        let report = DiscoveryReport {
            plugins,
            diagnostics: outcome.diagnostics.clone(),
        };
        self.state.store(Arc::new(RuntimeSnapshot {
            catalog,
            routes: outcome.routes,
            diagnostics: outcome.diagnostics,
        }));
        report
    }

    fn park(&self, orphaned: Vec<Arc<PluginSlot>>) {
        let mut detached = self.detached.lock();
        detached.retain(|slot| slot.state() != PluginState::Discovered);
        for slot in orphaned {
            if detached.iter().any(|parked| Arc::ptr_eq(parked, &slot)) {
                continue;
            }
            if slot.state() != PluginState::Discovered {
                tracing::info!(
                    plugin_id = %slot.plugin_id(),
                    "Plugin no longer cataloged; keeping live instance until unloaded"
                );
                detached.push(slot);
            }
        }
    }

    /// Owner plugin id of a capability key.
    pub fn find_owner(&self, key: &CapabilityKey) -> Option<String> {
        self.state.load().routes.find(key).map(str::to_string)
    }

    /// Load a cataloged plugin, or return the live instance.
    pub async fn ensure_loaded(&self, plugin_id: &str) -> Result<Arc<LoadedPlugin>, LoadFailure> {
        let entry = self
            .state
            .load()
            .catalog
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| LoadFailure::NotDiscovered(plugin_id.to_string()))?;
        self.load_entry(&entry).await
    }

    /// Load a catalog entry, which may come from an earlier discovery pass.
    ///
    /// An instance attached to an entry that has since left the catalog is
    /// parked so that `unload`, `loaded` and `shutdown` still reach it.
    pub async fn load_entry(&self, entry: &Arc<CatalogEntry>) -> Result<Arc<LoadedPlugin>, LoadFailure> {
        let plugin = self.lifecycle.load(entry).await?;
        self.keep_reachable(entry.slot());
        Ok(plugin)
    }

    fn keep_reachable(&self, slot: &Arc<PluginSlot>) {
        // Serialized with discover so the snapshot checked here is final.
        let _guard = self.discovery.lock();
        let cataloged = self
            .state
            .load()
            .catalog
            .get(slot.plugin_id())
            .is_some_and(|entry| Arc::ptr_eq(entry.slot(), slot));
        if !cataloged {
            self.park(vec![slot.clone()]);
        }
    }

    /// Tear down a plugin. Returns `false` if it was not loaded.
    pub async fn unload(&self, plugin_id: &str) -> bool {
        let slot = self.state.load().catalog.get(plugin_id).map(|e| e.slot().clone());
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let detached = self.detached.lock();
                match detached.iter().find(|s| s.plugin_id().eq_ignore_ascii_case(plugin_id)) {
                    Some(slot) => slot.clone(),
                    None => return false,
                }
            }
        };
        let unloaded = self.lifecycle.unload(&slot).await;
        self.detached.lock().retain(|s| !Arc::ptr_eq(s, &slot));
        unloaded
    }

    /// Cataloged plugins sorted by id.
    pub fn discovered(&self) -> Vec<Arc<CatalogEntry>> {
        self.state.load().catalog.entries()
    }

    /// Active plugins, cataloged or detached.
    pub fn loaded(&self) -> Vec<Arc<LoadedPlugin>> {
        let mut loaded: Vec<_> = self
            .state
            .load()
            .catalog
            .entries()
            .iter()
            .filter_map(|entry| entry.slot().active())
            .collect();
        loaded.extend(self.detached.lock().iter().filter_map(|slot| slot.active()));
        loaded
    }

    pub fn status(&self, plugin_id: &str) -> Option<PluginStatus> {
        let state = self.state.load();
        let entry = state.catalog.get(plugin_id)?;
        let manifest = entry.manifest();
        let slot = entry.slot();
        let active = slot.active();
        Some(PluginStatus {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            origin: entry.origin(),
            dir: entry.dir().to_path_buf(),
            state: slot.state(),
            load_count: slot.load_count(),
            last_failure: slot.last_failure(),
            stats: active.as_ref().map(|p| p.stats()),
            uptime: active.as_ref().map(|p| p.uptime()),
            private_modules: active.as_ref().map(|p| p.private_modules()).unwrap_or_default(),
        })
    }

    /// Diagnostics of the last discovery pass.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.state.load().diagnostics.clone()
    }

    /// Unload every active plugin. Returns how many were unloaded.
    pub async fn shutdown(&self) -> usize {
        let mut slots: Vec<Arc<PluginSlot>> = self
            .state
            .load()
            .catalog
            .entries()
            .iter()
            .map(|entry| entry.slot().clone())
            .collect();
        slots.extend(self.detached.lock().drain(..));

        let mut unloaded = 0;
        for slot in slots {
            if self.lifecycle.unload(&slot).await {
                unloaded += 1;
            }
        }
        tracing::info!(kind = %K::KIND, unloaded, "Plugin runtime shut down");
        unloaded
    }

    /// Load the owner of a capability, logging why it is unavailable.
    async fn load_owner(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        match self.ensure_loaded(plugin_id).await {
            Ok(plugin) => Some(plugin),
            Err(failure) => {
                tracing::warn!(
                    plugin_id = %plugin_id,
                    reason = failure.reason(),
                    error = %failure,
                    "Capability owner could not be loaded"
                );
                None
            }
        }
    }

    /// Run `call` against the instance, converting panics and errors to `None`.
    fn invoke<T>(
        &self,
        plugin: &LoadedPlugin,
        operation: &'static str,
        call: impl FnOnce(&mut PluginInstance) -> Result<T, PluginError>,
    ) -> Option<T> {
        let result = plugin.with_instance(|instance| call_plugin_safely(AssertUnwindSafe(|| call(instance))));
        match result {
            Ok(value) => {
                plugin.record_success();
                Some(value)
            }
            Err(e) => {
                tracing::warn!(plugin_id = %plugin.plugin_id(), operation, error = %e, "Plugin call failed");
                plugin.record_error(e.to_string());
                None
            }
        }
    }
}

fn device_vtable(instance: &PluginInstance) -> Result<DevicePluginVTable, PluginError> {
    instance
        .device
        .as_ref()
        .into_option()
        .cloned()
        .ok_or_else(|| PluginError::Unsupported("the device interface".into()))
}

fn panel_vtable(instance: &PluginInstance) -> Result<PanelPluginVTable, PluginError> {
    instance
        .panel
        .as_ref()
        .into_option()
        .cloned()
        .ok_or_else(|| PluginError::Unsupported("the panel interface".into()))
}

impl PluginRuntime<Device> {
    /// Create a driver for a physical device through its owning plugin.
    ///
    /// `transports` opens the device for the plugin; it is only used during
    /// this call.
    pub async fn create_physical_driver(
        &self,
        descriptor: &HardwareDescriptor,
        transports: &dyn TransportProvider,
    ) -> Option<DriverHandle> {
        let key = CapabilityKey::hardware(descriptor.vendor_id, descriptor.product_id);
        let Some(owner) = self.find_owner(&key) else {
            tracing::debug!(device = %key, "No device plugin for hardware");
            return None;
        };
        let plugin = self.load_owner(&owner).await?;

        let driver = self.invoke(&plugin, "create_physical_driver", |instance| {
            let device = device_vtable(instance)?;
            if !(device.supports_device)(&instance.handle, descriptor.vendor_id, descriptor.product_id) {
                return Ok(None);
            }
            let opener = device_opener(&transports);
            from_ffi((device.create_physical_driver)(&instance.handle, descriptor, opener)).map(ROption::into_option)
        })?;

        match driver {
            Some(driver) => Some(DriverHandle::new(driver, plugin)),
            None => {
                tracing::debug!(plugin_id = %owner, device = %key, "Plugin declined physical device");
                None
            }
        }
    }

    /// Create a driver for a network device speaking `protocol_id`.
    pub async fn create_virtual_driver(&self, protocol_id: &str, endpoint: &NetworkEndpoint) -> Option<DriverHandle> {
        let Some(owner) = self.find_owner(&CapabilityKey::protocol(protocol_id)) else {
            tracing::debug!(protocol_id, "No device plugin for protocol");
            return None;
        };
        let plugin = self.load_owner(&owner).await?;

        let protocol = RString::from(protocol_id);
        let driver = self.invoke(&plugin, "create_virtual_driver", |instance| {
            let device = device_vtable(instance)?;
            if !(device.supports_protocol)(&instance.handle, &protocol) {
                return Ok(None);
            }
            from_ffi((device.create_virtual_driver)(&instance.handle, &protocol, endpoint)).map(ROption::into_option)
        })??;
        Some(DriverHandle::new(driver, plugin))
    }

    /// Create a simulator packet handler for `protocol_id`.
    pub async fn create_simulator_handler(&self, protocol_id: &str) -> Option<SimulatorHandle> {
        let Some(owner) = self.find_owner(&CapabilityKey::protocol(protocol_id)) else {
            tracing::debug!(protocol_id, "No device plugin for protocol");
            return None;
        };
        let plugin = self.load_owner(&owner).await?;

        let protocol = RString::from(protocol_id);
        let handler = self.invoke(&plugin, "create_simulator_handler", |instance| {
            let device = device_vtable(instance)?;
            from_ffi((device.create_simulator_handler)(&instance.handle, &protocol)).map(ROption::into_option)
        })??;
        Some(SimulatorHandle::new(handler, plugin))
    }

    /// Whether any plugin routes this hardware id. Does not load plugins.
    pub fn is_device_supported(&self, vendor_id: u16, product_id: u16) -> bool {
        self.state.load().routes.find_hardware(vendor_id, product_id).is_some()
    }

    /// Protocol metadata from the owning plugin's manifest.
    pub fn protocol_info(&self, protocol_id: &str) -> Option<ProtocolCapability> {
        let state = self.state.load();
        let owner = state.routes.find_protocol(protocol_id)?;
        state
            .catalog
            .get(owner)?
            .manifest()
            .protocols()
            .iter()
            .find(|p| p.protocol_id.eq_ignore_ascii_case(protocol_id))
            .cloned()
    }

    /// Devices as routed, one per hardware id.
    pub fn supported_devices(&self) -> Vec<DeviceCapability> {
        let state = self.state.load();
        state
            .routes
            .hardware_routes()
            .into_iter()
            .filter_map(|((vendor_id, product_id), owner)| {
                state
                    .catalog
                    .get(owner)?
                    .manifest()
                    .devices()
                    .iter()
                    .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
                    .cloned()
            })
            .collect()
    }

    /// Protocols as routed, one per protocol id.
    pub fn supported_protocols(&self) -> Vec<ProtocolCapability> {
        let state = self.state.load();
        state
            .routes
            .protocol_routes()
            .into_iter()
            .filter_map(|(protocol_id, owner)| {
                state
                    .catalog
                    .get(owner)?
                    .manifest()
                    .protocols()
                    .iter()
                    .find(|p| p.protocol_id.eq_ignore_ascii_case(protocol_id))
                    .cloned()
            })
            .collect()
    }
}

impl PluginRuntime<Panel> {
    /// Create a panel from a type id or a prefixed input such as
    /// `video:path/to/file.mp4`.
    pub async fn create_panel(&self, input: &str, request: &PanelRequest) -> Option<PanelHandle> {
        let Some(resolved) = self.find_owner_for_input(input) else {
            tracing::debug!(input, "No panel plugin for input");
            return None;
        };
        let plugin = self.load_owner(&resolved.plugin_id).await?;

        let type_id = RString::from(resolved.type_id.as_str());
        let context = PanelCreationContext {
            type_id: type_id.clone(),
            argument: match &resolved.argument {
                Some(argument) => ROption::RSome(RString::from(argument.as_str())),
                None => ROption::RNone,
            },
            width: request.width,
            height: request.height,
            settings_json: RString::from(request.settings.to_string()),
        };
        let panel = self.invoke(&plugin, "create_panel", |instance| {
            let panels = panel_vtable(instance)?;
            from_ffi((panels.create_panel)(&instance.handle, &type_id, &context)).map(ROption::into_option)
        })?;

        match panel {
            Some(panel) => Some(PanelHandle::new(panel, plugin, resolved.type_id)),
            None => {
                tracing::debug!(plugin_id = %resolved.plugin_id, type_id = %resolved.type_id, "Plugin declined panel type");
                None
            }
        }
    }

    /// Resolve a panel input to its owner without loading anything.
    pub fn find_owner_for_input(&self, input: &str) -> Option<ResolvedPanel> {
        self.state.load().routes.resolve_panel_input(input)
    }

    /// Panel type metadata from the owning plugin's manifest.
    pub fn panel_type_info(&self, type_id: &str) -> Option<PanelTypeCapability> {
        let state = self.state.load();
        let route = state.routes.find_panel_type(type_id)?;
        state
            .catalog
            .get(&route.plugin_id)?
            .manifest()
            .panel_types()
            .iter()
            .find(|t| t.type_id.eq_ignore_ascii_case(&route.type_id))
            .cloned()
    }

    /// Panel types as routed, one per type id.
    pub fn panel_types(&self) -> Vec<PanelTypeCapability> {
        let state = self.state.load();
        let mut seen = std::collections::HashSet::new();
        state
            .routes
            .panel_type_routes()
            .into_iter()
            .filter(|(_, route)| seen.insert((route.plugin_id.to_ascii_lowercase(), route.type_id.to_ascii_lowercase())))
            .filter_map(|(_, route)| {
                state
                    .catalog
                    .get(&route.plugin_id)?
                    .manifest()
                    .panel_types()
                    .iter()
                    .find(|t| t.type_id.eq_ignore_ascii_case(&route.type_id))
                    .cloned()
            })
            .collect()
    }

    /// Panel types as reported by the loaded plugin itself.
    pub async fn reported_panel_types(&self, plugin_id: &str) -> Option<Vec<PanelTypeInfo>> {
        let plugin = self.load_owner(plugin_id).await?;
        self.invoke(&plugin, "panel_types", |instance| {
            let panels = panel_vtable(instance)?;
            Ok((panels.panel_types)(&instance.handle).into_vec())
        })
    }
}

impl<K> std::fmt::Debug for PluginRuntime<K>
where
    K: RuntimeKind,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load();
        f.debug_struct("PluginRuntime")
            .field("kind", &K::KIND)
            .field("search_paths", &self.search_paths)
            .field("plugins", &state.catalog.len())
            .field("routes", &state.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::loader::StaticModuleLoader;

    fn empty_runtime<K: RuntimeKind>(dir: &std::path::Path) -> PluginRuntime<K> {
        let loader = Arc::new(StaticModuleLoader::new());
        PluginRuntime::<K>::builder()
            .search_paths(vec![SearchPath::builtin(dir)])
            .loader(loader)
            .build()
    }

    #[test]
    fn test_sdk_version_matches_api_crate() {
        assert_eq!(sdk_version().to_string(), lcd_plugin_api::SDK_VERSION);
    }

    #[test]
    fn test_discover_empty_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let runtime = empty_runtime::<Panel>(temp.path());

        let report = runtime.discover();
        assert_eq!(report.plugin_count(), 0);
        assert!(report.diagnostics.is_empty());
        assert!(runtime.discovered().is_empty());
        assert!(runtime.find_owner_for_input("clock").is_none());
        assert_eq!(runtime.kind(), PluginKind::Panel);
    }

    #[test]
    fn test_ensure_loaded_unknown_id() {
        let temp = tempfile::TempDir::new().unwrap();
        let runtime = empty_runtime::<Device>(temp.path());
        runtime.discover();

        let err = tokio_test::block_on(runtime.ensure_loaded("com.example.missing")).unwrap_err();
        assert_eq!(err, LoadFailure::NotDiscovered("com.example.missing".into()));
        assert!(!tokio_test::block_on(runtime.unload("com.example.missing")));
        assert!(runtime.status("com.example.missing").is_none());
    }

    #[tokio::test]
    async fn test_passthroughs_without_owner_return_none() {
        let temp = tempfile::TempDir::new().unwrap();
        let runtime = empty_runtime::<Device>(temp.path());
        runtime.discover();

        assert!(!runtime.is_device_supported(0x0416, 0x5302));
        assert!(runtime.create_simulator_handler("acme").await.is_none());
        assert!(runtime.create_virtual_driver("acme", &NetworkEndpoint::new("127.0.0.1", 5555)).await.is_none());
        assert!(runtime.protocol_info("acme").is_none());
        assert!(runtime.supported_devices().is_empty());
        assert_eq!(runtime.shutdown().await, 0);
    }

    #[test]
    fn test_panel_request_defaults() {
        let request = PanelRequest::new(320, 240);
        assert_eq!(request.settings.to_string(), "{}");
        let request = request.with_settings(serde_json::json!({ "format": "24h" }));
        assert_eq!(request.settings["format"], "24h");
    }
}
