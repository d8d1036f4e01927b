//! # LCD Plugin API
//!
//! This crate is the shared contract between the LCD host and its plugins.
//! Device plugins translate frame buffers into a device's wire protocol;
//! panel plugins produce frame buffers from data sources. Both are compiled
//! as independent shared libraries and loaded by the host at runtime.
//!
//! # Type identity
//!
//! Every type that crosses the plugin boundary lives in this crate and is
//! `#[repr(C)]` + `StableAbi`. The host and every plugin agree on the layout
//! of these definitions, so a value built inside a plugin is the same type
//! on the host side. Plugins must not define their own copies of these types.
//!
//! # Entry point
//!
//! A plugin module exports exactly one symbol, [`ENTRY_SYMBOL`], with the
//! signature [`PluginEntryFn`]. It returns a [`PluginModule`] listing the
//! plugin types the module provides, one [`PluginExport`] per type. The host
//! picks the single export whose [`PluginKind`] matches the runtime asking
//! for it; zero or several matching exports make the module unloadable.
//!
//! # Example Plugin
//!
//! ```rust,ignore
//! use lcd_plugin_api::*;
//!
//! extern "C" fn create() -> RResult<PluginInstance, RString> {
//!     RResult::ROk(PluginInstance::panel(
//!         ObjectHandle::new(MyPanelPlugin::default()),
//!         PluginInfo::new("com.example.clock", "Clock", "1.0.0"),
//!         CommonVTable { initialize, teardown },
//!         PanelPluginVTable { panel_types, create_panel },
//!     ))
//! }
//!
//! export_plugin!(PluginKind::Panel => create);
//! ```

use abi_stable::StableAbi;
use serde::de::DeserializeOwned;

// =============================================================================
// Re-exports for plugin developers
// =============================================================================

pub use abi_stable;
pub use abi_stable::std_types::{ROption, RResult, RString, RVec};

// =============================================================================
// Versions
// =============================================================================

/// Major ABI version. Plugins with a different major version are rejected.
pub const ABI_VERSION_MAJOR: u32 = 1;

/// Minor ABI version. Newer minor versions only append fields.
pub const ABI_VERSION_MINOR: u32 = 0;

/// SDK version of this contract crate.
///
/// Manifests declare the minimum SDK version they need; the host compares it
/// against this value.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Null-terminated name of the exported entry symbol.
pub const ENTRY_SYMBOL: &[u8] = b"lcd_plugin_entry\0";

/// Host service name that returns the plugin's settings as JSON.
pub const SETTINGS_SERVICE: &str = "plugin.settings";

/// ABI version pair reported by a module.
#[repr(C)]
#[derive(StableAbi, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbiVersion {
    pub major: u32,
    pub minor: u32,
}

impl AbiVersion {
    /// The ABI version this crate was compiled with.
    pub const CURRENT: AbiVersion = AbiVersion {
        major: ABI_VERSION_MAJOR,
        minor: ABI_VERSION_MINOR,
    };
}

/// Semantic version triple in FFI-safe form.
#[repr(C)]
#[derive(StableAbi, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse a `major.minor.patch` string. Pre-release and build suffixes are ignored.
    pub fn parse(version: &str) -> Option<Self> {
        let core = version
            .trim()
            .split(|c| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.').map(|p| p.parse::<u32>());
        let major = parts.next()?.ok()?;
        let minor = parts.next()?.ok()?;
        let patch = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }

    /// The SDK version of this crate.
    pub fn sdk() -> Self {
        Self::parse(SDK_VERSION).unwrap_or(Self::new(1, 0, 0))
    }
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// =============================================================================
// FFI Result Type
// =============================================================================

/// FFI-safe result type.
pub type FfiResult = RResult<(), RString>;

/// Helper to create success result.
pub fn ffi_ok() -> FfiResult {
    RResult::ROk(())
}

/// Helper to create error result.
pub fn ffi_err(msg: impl Into<RString>) -> FfiResult {
    RResult::RErr(msg.into())
}

// =============================================================================
// Opaque Object Handle
// =============================================================================

/// Opaque handle to an object owned by the other side of the boundary.
///
/// The pointer is type-erased; `drop_fn` was instantiated by the side that
/// created the object and frees it with the correct type.
#[repr(C)]
#[derive(StableAbi)]
pub struct ObjectHandle {
    /// Pointer to the object state
    pub ptr: *mut (),
    /// Drop function that frees the object
    pub drop_fn: Option<extern "C" fn(*mut ())>,
}

impl ObjectHandle {
    /// Create a new handle from a boxed value.
    pub fn new<T>(value: T) -> Self {
        let boxed = Box::new(value);
        let ptr = Box::into_raw(boxed) as *mut ();

        extern "C" fn drop_impl<T>(ptr: *mut ()) {
            unsafe {
                let _ = Box::from_raw(ptr as *mut T);
            }
        }

        Self {
            ptr,
            drop_fn: Some(drop_impl::<T>),
        }
    }

    /// Create a null handle.
    pub fn null() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            drop_fn: None,
        }
    }

    /// Check if the handle is null.
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Get a reference to the underlying value.
    ///
    /// # Safety
    /// The caller must ensure T matches the original type and ptr is valid.
    pub unsafe fn as_ref<T>(&self) -> &T {
        &*(self.ptr as *const T)
    }

    /// Get a mutable reference to the underlying value.
    ///
    /// # Safety
    /// The caller must ensure T matches the original type and ptr is valid.
    pub unsafe fn as_mut<T>(&mut self) -> &mut T {
        &mut *(self.ptr as *mut T)
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.drop_fn {
            if !self.ptr.is_null() {
                drop_fn(self.ptr);
            }
        }
    }
}

// Safety: objects behind a handle are required to be thread-safe by the
// contract; the host serializes calls that take `*mut ObjectHandle`.
unsafe impl Send for ObjectHandle {}
unsafe impl Sync for ObjectHandle {}

/// Borrow the state behind a raw handle pointer.
///
/// Returns `None` for a null pointer or a null handle.
///
/// # Safety
/// `handle` must be null or point to a live `ObjectHandle` created with `T`.
pub unsafe fn handle_state<'a, T>(handle: *const ObjectHandle) -> Option<&'a T> {
    if handle.is_null() {
        return None;
    }
    let handle = &*handle;
    if handle.is_null() {
        return None;
    }
    Some(handle.as_ref::<T>())
}

/// Mutably borrow the state behind a raw handle pointer.
///
/// # Safety
/// Same as [`handle_state`], and no other reference to the state may exist.
pub unsafe fn handle_state_mut<'a, T>(handle: *mut ObjectHandle) -> Option<&'a mut T> {
    if handle.is_null() {
        return None;
    }
    let handle = &mut *handle;
    if handle.is_null() {
        return None;
    }
    Some(handle.as_mut::<T>())
}

// =============================================================================
// Frames
// =============================================================================

/// Pixel layout of a frame buffer.
#[repr(u8)]
#[derive(StableAbi, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 16-bit RGB, little-endian
    Rgb565 = 0,
    /// 24-bit packed RGB
    Rgb888 = 1,
    /// 32-bit RGBA
    Rgba8888 = 2,
    /// Encoded JPEG image
    Jpeg = 3,
}

impl PixelFormat {
    /// Bytes per pixel, `None` for encoded formats.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb565 => Some(2),
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Rgba8888 => Some(4),
            PixelFormat::Jpeg => None,
        }
    }
}

/// A rendered frame.
#[repr(C)]
#[derive(StableAbi, Clone, Debug)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: RVec<u8>,
}

impl FrameBuffer {
    /// Create a frame from raw bytes.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<RVec<u8>>) -> Self {
        Self {
            width,
            height,
            format,
            data: data.into(),
        }
    }

    /// Create a zero-filled raw frame.
    pub fn blank(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = format
            .bytes_per_pixel()
            .map(|bpp| width as usize * height as usize * bpp)
            .unwrap_or(0);
        Self::new(width, height, format, vec![0u8; len])
    }

    /// Expected byte length for raw formats.
    pub fn expected_len(&self) -> Option<usize> {
        self.format
            .bytes_per_pixel()
            .map(|bpp| self.width as usize * self.height as usize * bpp)
    }

    /// Whether the data length matches the dimensions.
    pub fn is_consistent(&self) -> bool {
        match self.expected_len() {
            Some(len) => len == self.data.len(),
            None => !self.data.is_empty(),
        }
    }
}

/// Panel orientation.
#[repr(u8)]
#[derive(StableAbi, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Landscape = 0,
    Portrait = 1,
    LandscapeFlipped = 2,
    PortraitFlipped = 3,
}

// =============================================================================
// Plugin identity and context
// =============================================================================

/// The two plugin categories.
#[repr(u8)]
#[derive(StableAbi, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PluginKind {
    /// Translates frames into a device wire protocol
    Device = 0,
    /// Produces frames from a data source
    Panel = 1,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginKind::Device => write!(f, "device"),
            PluginKind::Panel => write!(f, "panel"),
        }
    }
}

/// Identity reported by a plugin instance.
#[repr(C)]
#[derive(StableAbi, Clone, Debug)]
pub struct PluginInfo {
    pub id: RString,
    pub name: RString,
    pub version: RString,
}

impl PluginInfo {
    pub fn new(id: impl Into<RString>, name: impl Into<RString>, version: impl Into<RString>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Log level for host logging callbacks.
#[repr(u8)]
#[derive(StableAbi, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

/// Wrapper for the host log callback.
#[repr(transparent)]
#[derive(StableAbi, Clone, Copy)]
pub struct LogCallbackFn {
    pub func: extern "C" fn(user_data: *const (), level: LogLevel, message: *const RString),
}

/// Wrapper for the host service resolution callback.
#[repr(transparent)]
#[derive(StableAbi, Clone, Copy)]
pub struct ResolveServiceFn {
    pub func: extern "C" fn(user_data: *const (), name: *const RString) -> ROption<RString>,
}

/// Host-provided accessors.
///
/// `user_data` stays valid from `initialize` until `teardown` returns, so a
/// plugin may keep a copy of this struct for its lifetime.
#[repr(C)]
#[derive(StableAbi, Clone, Copy)]
pub struct HostCallbacks {
    pub user_data: *const (),
    pub log: LogCallbackFn,
    pub resolve_service: ResolveServiceFn,
}

// Safety: the host-side state behind `user_data` is immutable or internally
// synchronized, and outlives the plugin instance.
unsafe impl Send for HostCallbacks {}
unsafe impl Sync for HostCallbacks {}

impl HostCallbacks {
    /// Emit a log line through the host.
    pub fn log(&self, level: LogLevel, message: impl Into<RString>) {
        let message = message.into();
        (self.log.func)(self.user_data, level, &message);
    }

    /// Look up a host service value by name.
    pub fn resolve_service(&self, name: &str) -> Option<String> {
        let name = RString::from(name);
        (self.resolve_service.func)(self.user_data, &name)
            .into_option()
            .map(RString::into_string)
    }
}

/// Context handed to `initialize`.
///
/// This is the only channel through which a plugin reaches host services.
#[repr(C)]
#[derive(StableAbi, Clone)]
pub struct PluginContext {
    /// Plugin id from the manifest
    pub plugin_id: RString,
    /// Absolute directory the plugin was loaded from
    pub plugin_dir: RString,
    /// Runtime version negotiated by the host
    pub runtime_version: SemVer,
    /// Host accessors
    pub host: HostCallbacks,
}

impl PluginContext {
    /// Emit a log line through the host.
    pub fn log(&self, level: LogLevel, message: impl Into<RString>) {
        self.host.log(level, message);
    }

    /// Look up a host service value by name.
    pub fn resolve_service(&self, name: &str) -> Option<String> {
        self.host.resolve_service(name)
    }

    /// Deserialize the plugin's settings, if the host configured any.
    pub fn settings<T: DeserializeOwned>(&self) -> Option<T> {
        self.resolve_service(SETTINGS_SERVICE)
            .and_then(|json| serde_json::from_str(&json).ok())
    }
}

// =============================================================================
// Device side: hardware, transports, drivers, simulator handlers
// =============================================================================

/// Identifies a physical device found by the host's transport layer.
#[repr(C)]
#[derive(StableAbi, Clone, Debug)]
pub struct HardwareDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Transport-specific device path
    pub path: RString,
    pub serial_number: ROption<RString>,
}

impl HardwareDescriptor {
    pub fn new(vendor_id: u16, product_id: u16, path: impl Into<RString>) -> Self {
        Self {
            vendor_id,
            product_id,
            path: path.into(),
            serial_number: ROption::RNone,
        }
    }
}

/// Network endpoint of a virtual device.
#[repr(C)]
#[derive(StableAbi, Clone, Debug)]
pub struct NetworkEndpoint {
    pub host: RString,
    pub port: u16,
}

impl NetworkEndpoint {
    pub fn new(host: impl Into<RString>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// VTable for an open device transport (host-owned).
#[repr(C)]
#[derive(StableAbi, Clone)]
pub struct TransportVTable {
    /// Write raw bytes to the device.
    pub write: extern "C" fn(handle: *mut ObjectHandle, data: *const u8, len: usize) -> FfiResult,

    /// Read up to `capacity` bytes, waiting at most `timeout_ms`.
    pub read: extern "C" fn(
        handle: *mut ObjectHandle,
        buffer: *mut u8,
        capacity: usize,
        timeout_ms: u32,
    ) -> RResult<usize, RString>,
}

/// An open device transport, created by the host and used by a driver.
#[repr(C)]
#[derive(StableAbi)]
pub struct Transport {
    pub handle: ObjectHandle,
    pub vtable: TransportVTable,
}

impl Transport {
    /// Write raw bytes.
    pub fn write(&mut self, data: &[u8]) -> FfiResult {
        (self.vtable.write)(&mut self.handle, data.as_ptr(), data.len())
    }

    /// Read into `buffer`, returning the byte count.
    pub fn read(&mut self, buffer: &mut [u8], timeout_ms: u32) -> RResult<usize, RString> {
        (self.vtable.read)(&mut self.handle, buffer.as_mut_ptr(), buffer.len(), timeout_ms)
    }
}

/// Wrapper for the host's transport open function.
#[repr(transparent)]
#[derive(StableAbi, Clone, Copy)]
pub struct OpenTransportFn {
    pub func: extern "C" fn(
        user_data: *const (),
        descriptor: *const HardwareDescriptor,
    ) -> RResult<Transport, RString>,
}

/// Host-provided device opener.
///
/// Only valid for the duration of the `create_physical_driver` call; a driver
/// opens its transport there and keeps the returned [`Transport`].
#[repr(C)]
#[derive(StableAbi, Clone, Copy)]
pub struct DeviceOpener {
    pub user_data: *const (),
    pub open: OpenTransportFn,
}

impl DeviceOpener {
    /// Open the transport for a device.
    pub fn open(&self, descriptor: &HardwareDescriptor) -> RResult<Transport, RString> {
        (self.open.func)(self.user_data, descriptor)
    }
}

/// Static information about a driver.
#[repr(C)]
#[derive(StableAbi, Clone, Debug)]
pub struct DriverInfo {
    pub name: RString,
    pub protocol_id: RString,
    pub width: u32,
    pub height: u32,
    pub supports_brightness: bool,
    pub supports_orientation: bool,
}

/// VTable for device driver operations.
#[repr(C)]
#[derive(StableAbi, Clone)]
pub struct DriverVTable {
    /// Describe the driver.
    pub info: extern "C" fn(handle: *const ObjectHandle) -> DriverInfo,

    /// Encode and send a frame to the device.
    pub send_frame: extern "C" fn(handle: *mut ObjectHandle, frame: *const FrameBuffer) -> FfiResult,

    /// Set brightness (0-100).
    pub set_brightness: extern "C" fn(handle: *mut ObjectHandle, level: u8) -> FfiResult,

    /// Set panel orientation.
    pub set_orientation: extern "C" fn(handle: *mut ObjectHandle, orientation: Orientation) -> FfiResult,
}

/// Device driver instance with handle and vtable.
#[repr(C)]
#[derive(StableAbi)]
pub struct DeviceDriver {
    pub handle: ObjectHandle,
    pub vtable: DriverVTable,
}

impl DeviceDriver {
    pub fn info(&self) -> DriverInfo {
        (self.vtable.info)(&self.handle)
    }

    pub fn send_frame(&mut self, frame: &FrameBuffer) -> FfiResult {
        (self.vtable.send_frame)(&mut self.handle, frame)
    }

    pub fn set_brightness(&mut self, level: u8) -> FfiResult {
        (self.vtable.set_brightness)(&mut self.handle, level)
    }

    pub fn set_orientation(&mut self, orientation: Orientation) -> FfiResult {
        (self.vtable.set_orientation)(&mut self.handle, orientation)
    }
}

/// VTable for the virtual-device simulator side of a protocol.
#[repr(C)]
#[derive(StableAbi, Clone)]
pub struct SimulatorVTable {
    /// Protocol handled by this simulator.
    pub protocol_id: extern "C" fn(handle: *const ObjectHandle) -> RString,

    /// Decode one incoming packet; returns a frame once one is complete.
    pub handle_packet: extern "C" fn(
        handle: *mut ObjectHandle,
        data: *const u8,
        len: usize,
    ) -> RResult<ROption<FrameBuffer>, RString>,
}

/// Simulator handler instance with handle and vtable.
#[repr(C)]
#[derive(StableAbi)]
pub struct SimulatorHandler {
    pub handle: ObjectHandle,
    pub vtable: SimulatorVTable,
}

impl SimulatorHandler {
    pub fn protocol_id(&self) -> RString {
        (self.vtable.protocol_id)(&self.handle)
    }

    pub fn handle_packet(&mut self, packet: &[u8]) -> RResult<ROption<FrameBuffer>, RString> {
        (self.vtable.handle_packet)(&mut self.handle, packet.as_ptr(), packet.len())
    }
}

// =============================================================================
// Panel side
// =============================================================================

/// Panel-type metadata reported by a panel plugin.
#[repr(C)]
#[derive(StableAbi, Clone, Debug)]
pub struct PanelTypeInfo {
    pub type_id: RString,
    pub display_name: RString,
    pub prefix_pattern: ROption<RString>,
    pub is_live: bool,
    pub is_animated: bool,
}

/// Arguments for creating a panel.
#[repr(C)]
#[derive(StableAbi, Clone, Debug)]
pub struct PanelCreationContext {
    /// Panel type id that routed the request
    pub type_id: RString,
    /// Text after the prefix pattern, e.g. the path in `video:path/to/file.mp4`
    pub argument: ROption<RString>,
    pub width: u32,
    pub height: u32,
    /// Panel settings as a JSON document
    pub settings_json: RString,
}

/// VTable for panel operations.
#[repr(C)]
#[derive(StableAbi, Clone)]
pub struct PanelVTable {
    /// Refresh data from the panel's source.
    pub update: extern "C" fn(handle: *mut ObjectHandle) -> FfiResult,

    /// Render the current state into a frame.
    pub render: extern "C" fn(handle: *mut ObjectHandle, width: u32, height: u32) -> RResult<FrameBuffer, RString>,
}

/// Panel instance with handle and vtable.
#[repr(C)]
#[derive(StableAbi)]
pub struct Panel {
    pub handle: ObjectHandle,
    pub vtable: PanelVTable,
}

impl Panel {
    pub fn update(&mut self) -> FfiResult {
        (self.vtable.update)(&mut self.handle)
    }

    pub fn render(&mut self, width: u32, height: u32) -> RResult<FrameBuffer, RString> {
        (self.vtable.render)(&mut self.handle, width, height)
    }
}

// =============================================================================
// Plugin instance (entry-point contract)
// =============================================================================

/// Lifecycle functions shared by both plugin kinds.
#[repr(C)]
#[derive(StableAbi, Clone)]
pub struct CommonVTable {
    /// Initialize the plugin with its context. Called once per load.
    pub initialize: extern "C" fn(handle: *mut ObjectHandle, context: *const PluginContext) -> FfiResult,

    /// Release everything the plugin holds. Called once before unload.
    pub teardown: extern "C" fn(handle: *mut ObjectHandle) -> FfiResult,
}

/// Device plugin factory methods.
#[repr(C)]
#[derive(StableAbi, Clone)]
pub struct DevicePluginVTable {
    pub create_physical_driver: extern "C" fn(
        handle: *const ObjectHandle,
        descriptor: *const HardwareDescriptor,
        opener: DeviceOpener,
    ) -> RResult<ROption<DeviceDriver>, RString>,

    pub create_virtual_driver: extern "C" fn(
        handle: *const ObjectHandle,
        protocol_id: *const RString,
        endpoint: *const NetworkEndpoint,
    ) -> RResult<ROption<DeviceDriver>, RString>,

    pub create_simulator_handler: extern "C" fn(
        handle: *const ObjectHandle,
        protocol_id: *const RString,
    ) -> RResult<ROption<SimulatorHandler>, RString>,

    pub supports_device: extern "C" fn(handle: *const ObjectHandle, vendor_id: u16, product_id: u16) -> bool,

    pub supports_protocol: extern "C" fn(handle: *const ObjectHandle, protocol_id: *const RString) -> bool,
}

/// Panel plugin factory methods.
#[repr(C)]
#[derive(StableAbi, Clone)]
pub struct PanelPluginVTable {
    pub panel_types: extern "C" fn(handle: *const ObjectHandle) -> RVec<PanelTypeInfo>,

    pub create_panel: extern "C" fn(
        handle: *const ObjectHandle,
        type_id: *const RString,
        context: *const PanelCreationContext,
    ) -> RResult<ROption<Panel>, RString>,
}

/// A constructed plugin instance.
#[repr(C)]
#[derive(StableAbi)]
pub struct PluginInstance {
    pub handle: ObjectHandle,
    pub info: PluginInfo,
    pub common: CommonVTable,
    /// Present on device plugins
    pub device: ROption<DevicePluginVTable>,
    /// Present on panel plugins
    pub panel: ROption<PanelPluginVTable>,
}

impl PluginInstance {
    /// Build a device plugin instance.
    pub fn device(handle: ObjectHandle, info: PluginInfo, common: CommonVTable, device: DevicePluginVTable) -> Self {
        Self {
            handle,
            info,
            common,
            device: ROption::RSome(device),
            panel: ROption::RNone,
        }
    }

    /// Build a panel plugin instance.
    pub fn panel(handle: ObjectHandle, info: PluginInfo, common: CommonVTable, panel: PanelPluginVTable) -> Self {
        Self {
            handle,
            info,
            common,
            device: ROption::RNone,
            panel: ROption::RSome(panel),
        }
    }

    /// Kind implied by the vtables present.
    pub fn kind(&self) -> Option<PluginKind> {
        match (self.device.is_some(), self.panel.is_some()) {
            (true, false) => Some(PluginKind::Device),
            (false, true) => Some(PluginKind::Panel),
            _ => None,
        }
    }
}

/// Constructor for one plugin type provided by a module.
#[repr(C)]
#[derive(StableAbi, Clone, Copy)]
pub struct PluginExport {
    pub kind: PluginKind,
    pub create: extern "C" fn() -> RResult<PluginInstance, RString>,
}

/// Root value returned by the entry symbol.
#[repr(C)]
#[derive(StableAbi)]
pub struct PluginModule {
    pub abi_version: AbiVersion,
    pub sdk_version: SemVer,
    pub exports: RVec<PluginExport>,
}

impl PluginModule {
    /// Module description compiled against this crate's versions.
    pub fn new(exports: Vec<PluginExport>) -> Self {
        Self {
            abi_version: AbiVersion::CURRENT,
            sdk_version: SemVer::sdk(),
            exports: RVec::from(exports),
        }
    }

    /// Exports of the given kind.
    pub fn exports_of(&self, kind: PluginKind) -> impl Iterator<Item = &PluginExport> {
        self.exports.iter().filter(move |e| e.kind == kind)
    }
}

/// Signature of the exported entry symbol.
pub type PluginEntryFn = extern "C" fn() -> PluginModule;

/// Export the module entry symbol.
///
/// ```rust,ignore
/// export_plugin!(PluginKind::Device => create_device_plugin);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($($kind:expr => $create:path),+ $(,)?) => {
        #[no_mangle]
        pub extern "C" fn lcd_plugin_entry() -> $crate::PluginModule {
            $crate::PluginModule::new(vec![
                $($crate::PluginExport { kind: $kind, create: $create }),+
            ])
        }
    };
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_semver_parse() {
        assert_eq!(SemVer::parse("1.2.3"), Some(SemVer::new(1, 2, 3)));
        assert_eq!(SemVer::parse("2.0.1-beta.1"), Some(SemVer::new(2, 0, 1)));
        assert_eq!(SemVer::parse("1.2"), None);
        assert_eq!(SemVer::parse("x.y.z"), None);
        assert!(SemVer::new(1, 10, 0) > SemVer::new(1, 9, 9));
    }

    #[test]
    fn test_sdk_version_matches_package() {
        assert_eq!(SemVer::sdk().to_string(), SDK_VERSION);
    }

    #[test]
    fn test_object_handle() {
        struct TestState {
            value: i32,
        }

        let handle = ObjectHandle::new(TestState { value: 42 });

        unsafe {
            let state = handle.as_ref::<TestState>();
            assert_eq!(state.value, 42);
            let via_ptr = handle_state::<TestState>(&handle).unwrap();
            assert_eq!(via_ptr.value, 42);
        }
    }

    #[test]
    fn test_object_handle_null() {
        let handle = ObjectHandle::null();
        assert!(handle.is_null());
        unsafe {
            assert!(handle_state::<u32>(&handle).is_none());
            assert!(handle_state::<u32>(std::ptr::null()).is_none());
        }
    }

    #[test]
    fn test_frame_buffer_consistency() {
        let frame = FrameBuffer::blank(320, 240, PixelFormat::Rgb565);
        assert_eq!(frame.data.len(), 320 * 240 * 2);
        assert!(frame.is_consistent());

        let short = FrameBuffer::new(10, 10, PixelFormat::Rgb888, vec![0u8; 10]);
        assert!(!short.is_consistent());

        let jpeg = FrameBuffer::new(480, 480, PixelFormat::Jpeg, vec![0xFF, 0xD8]);
        assert!(jpeg.is_consistent());
        assert_eq!(jpeg.expected_len(), None);
    }

    #[test]
    fn test_ffi_result_helpers() {
        assert!(matches!(ffi_ok(), RResult::ROk(())));
        assert!(matches!(ffi_err("boom"), RResult::RErr(_)));
    }

    static LOGGED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    extern "C" fn test_log(_user_data: *const (), _level: LogLevel, message: *const RString) {
        let message = unsafe { &*message };
        LOGGED.lock().unwrap().push(message.to_string());
    }

    extern "C" fn test_resolve(_user_data: *const (), name: *const RString) -> ROption<RString> {
        let name = unsafe { &*name };
        if name.as_str() == SETTINGS_SERVICE {
            ROption::RSome(RString::from(r#"{"refresh_ms": 250}"#))
        } else {
            ROption::RNone
        }
    }

    #[test]
    fn test_plugin_context_callbacks() {
        #[derive(serde::Deserialize)]
        struct Settings {
            refresh_ms: u32,
        }

        let context = PluginContext {
            plugin_id: "com.example.test".into(),
            plugin_dir: "/tmp/plugins/test".into(),
            runtime_version: SemVer::new(1, 0, 0),
            host: HostCallbacks {
                user_data: std::ptr::null(),
                log: LogCallbackFn { func: test_log },
                resolve_service: ResolveServiceFn { func: test_resolve },
            },
        };

        context.log(LogLevel::Info, "hello from plugin");
        assert!(LOGGED.lock().unwrap().iter().any(|m| m == "hello from plugin"));

        let settings: Settings = context.settings().unwrap();
        assert_eq!(settings.refresh_ms, 250);
        assert!(context.resolve_service("unknown").is_none());
    }

    extern "C" fn create_nothing() -> RResult<PluginInstance, RString> {
        RResult::RErr("not constructible".into())
    }

    #[test]
    fn test_plugin_module_exports_of() {
        let module = PluginModule::new(vec![
            PluginExport {
                kind: PluginKind::Device,
                create: create_nothing,
            },
            PluginExport {
                kind: PluginKind::Panel,
                create: create_nothing,
            },
        ]);
        assert_eq!(module.abi_version, AbiVersion::CURRENT);
        assert_eq!(module.exports_of(PluginKind::Device).count(), 1);
        assert_eq!(module.exports_of(PluginKind::Panel).count(), 1);
    }

    #[test]
    fn test_callback_wrapper_types() {
        assert_eq!(
            std::mem::size_of::<LogCallbackFn>(),
            std::mem::size_of::<extern "C" fn(*const (), LogLevel, *const RString)>()
        );
    }
}
