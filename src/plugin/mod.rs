//! Plugin runtime for LCD devices and panels
//!
//! Device drivers and display panels ship as separately built modules that
//! are found at runtime instead of being linked into the host. This module
//! discovers them, loads them behind an isolation boundary, and routes
//! hardware ids, protocols and panel types to the plugin that serves them.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         PluginRuntime<K>                          │
//! │  search paths ──▶ Catalog::scan ──▶ catalog + RoutingTable (swap) │
//! │  find_owner ──▶ LifecycleManager::load ──▶ LoadedPlugin           │
//! │                     Boundary ──▶ ModuleLoader ──▶ entry symbol    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each plugin directory holds a `plugin.json` manifest and the entry
//! module it names. Modules see one copy of the shared contract crate
//! (`lcd_plugin_api`) and a private copy of everything else.
//!
//! # Usage
//!
//! ```ignore
//! use lcd_host::plugin::prelude::*;
//!
//! let devices = DeviceRuntime::builder().build();
//! devices.discover();
//!
//! let descriptor = HardwareDescriptor::new(0x0416, 0x5302, "/dev/hidraw3");
//! if let Some(mut driver) = devices.create_physical_driver(&descriptor, &usb).await {
//!     driver.send_frame(&frame)?;
//! }
//! ```

pub mod adapters;
pub mod boundary;
pub mod catalog;
pub mod context;
pub mod isolation;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod routing;
pub mod runtime;
pub mod search_paths;

// Re-exports for convenience
pub use adapters::{DeviceTransport, DriverDetails, DriverHandle, PanelHandle, SimulatorHandle, TransportProvider};
pub use boundary::{Boundary, BoundaryError, SharedModules};
pub use catalog::{Catalog, CatalogEntry, Diagnostic, DiagnosticKind, DiagnosticSeverity};
pub use context::{FfiContext, HostContext, HostServices};
pub use isolation::{PluginError, call_plugin_safely};
pub use lifecycle::{CallStats, LoadFailure, LoadedPlugin, PluginState};
pub use loader::{ModuleLoader, NativeModuleLoader, StaticModuleLoader};
pub use manifest::{ManifestError, PluginManifest};
pub use routing::{CapabilityKey, ResolvedPanel, RoutingTable};
pub use runtime::{
    DeviceRuntime, DiscoveryReport, PanelRequest, PanelRuntime, PluginRuntime, PluginStatus, RuntimeKind,
};
pub use search_paths::{PluginOrigin, SearchPath};

/// Prelude module for convenient imports
///
/// ```ignore
/// use lcd_host::plugin::prelude::*;
/// ```
pub mod prelude {
    pub use super::adapters::{DeviceTransport, DriverHandle, PanelHandle, SimulatorHandle, TransportProvider};
    pub use super::catalog::{Diagnostic, DiagnosticSeverity};
    pub use super::isolation::PluginError;
    pub use super::lifecycle::{LoadFailure, PluginState};
    pub use super::routing::CapabilityKey;
    pub use super::runtime::{DeviceRuntime, DiscoveryReport, PanelRequest, PanelRuntime, PluginStatus};
    pub use super::search_paths::SearchPath;

    // Contract types handed to and from plugins
    pub use lcd_plugin_api::{
        FrameBuffer, HardwareDescriptor, NetworkEndpoint, Orientation, PixelFormat, PluginKind,
    };
    pub use std::sync::Arc;
}
