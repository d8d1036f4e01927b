//! Host-side wrappers for plugin-created objects
//!
//! Drivers, panels and simulator handlers are built by plugin code and freed
//! by plugin code. Each wrapper keeps an `Arc<LoadedPlugin>` so the module
//! stays mapped for as long as the object exists; unloading the plugin while
//! a wrapper is alive only defers the release.
//!
//! The other direction is the device transport: the host's USB/HID layer is
//! exposed to a plugin as an FFI [`Transport`] built from a
//! [`TransportProvider`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use lcd_plugin_api::{
    DeviceDriver, DeviceOpener, FfiResult, FrameBuffer, HardwareDescriptor, ObjectHandle, OpenTransportFn,
    Orientation, Panel, RResult, RString, SimulatorHandler, Transport, TransportVTable, ffi_err, ffi_ok,
    handle_state_mut,
};

use super::isolation::{PluginError, call_plugin_safely, extract_panic_message, from_ffi};
use super::lifecycle::LoadedPlugin;

/// Owned copy of a driver's self-description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDetails {
    pub name: String,
    pub protocol_id: String,
    pub width: u32,
    pub height: u32,
    pub supports_brightness: bool,
    pub supports_orientation: bool,
}

fn record<T>(plugin: &LoadedPlugin, result: Result<T, PluginError>) -> Result<T, PluginError> {
    match &result {
        Ok(_) => plugin.record_success(),
        Err(e) => plugin.record_error(e.to_string()),
    }
    result
}

/// A device driver created by a plugin.
pub struct DriverHandle {
    driver: DeviceDriver,
    plugin: Arc<LoadedPlugin>,
}

impl DriverHandle {
    pub(crate) fn new(driver: DeviceDriver, plugin: Arc<LoadedPlugin>) -> Self {
        Self { driver, plugin }
    }

    /// Id of the plugin that created this driver.
    pub fn plugin_id(&self) -> &str {
        self.plugin.plugin_id()
    }

    pub fn details(&self) -> Result<DriverDetails, PluginError> {
        let driver = &self.driver;
        let info = call_plugin_safely(AssertUnwindSafe(|| Ok(driver.info())))?;
        Ok(DriverDetails {
            name: info.name.into_string(),
            protocol_id: info.protocol_id.into_string(),
            width: info.width,
            height: info.height,
            supports_brightness: info.supports_brightness,
            supports_orientation: info.supports_orientation,
        })
    }

    pub fn send_frame(&mut self, frame: &FrameBuffer) -> Result<(), PluginError> {
        let driver = &mut self.driver;
        let result = call_plugin_safely(AssertUnwindSafe(|| from_ffi(driver.send_frame(frame))));
        record(&self.plugin, result)
    }

    pub fn set_brightness(&mut self, level: u8) -> Result<(), PluginError> {
        let driver = &mut self.driver;
        let result = call_plugin_safely(AssertUnwindSafe(|| from_ffi(driver.set_brightness(level.min(100)))));
        record(&self.plugin, result)
    }

    pub fn set_orientation(&mut self, orientation: Orientation) -> Result<(), PluginError> {
        let driver = &mut self.driver;
        let result = call_plugin_safely(AssertUnwindSafe(|| from_ffi(driver.set_orientation(orientation))));
        record(&self.plugin, result)
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle").field("plugin_id", &self.plugin_id()).finish()
    }
}

/// A panel created by a plugin.
pub struct PanelHandle {
    panel: Panel,
    plugin: Arc<LoadedPlugin>,
    type_id: String,
}

impl PanelHandle {
    pub(crate) fn new(panel: Panel, plugin: Arc<LoadedPlugin>, type_id: String) -> Self {
        Self { panel, plugin, type_id }
    }

    pub fn plugin_id(&self) -> &str {
        self.plugin.plugin_id()
    }

    /// Panel type this panel was created for.
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// Refresh the panel's data.
    pub fn update(&mut self) -> Result<(), PluginError> {
        let panel = &mut self.panel;
        let result = call_plugin_safely(AssertUnwindSafe(|| from_ffi(panel.update())));
        record(&self.plugin, result)
    }

    /// Render a frame of the given size.
    pub fn render(&mut self, width: u32, height: u32) -> Result<FrameBuffer, PluginError> {
        let panel = &mut self.panel;
        let result = call_plugin_safely(AssertUnwindSafe(|| from_ffi(panel.render(width, height))));
        record(&self.plugin, result)
    }
}

impl std::fmt::Debug for PanelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelHandle")
            .field("plugin_id", &self.plugin_id())
            .field("type_id", &self.type_id)
            .finish()
    }
}

/// A simulator packet handler created by a plugin.
pub struct SimulatorHandle {
    handler: SimulatorHandler,
    plugin: Arc<LoadedPlugin>,
}

impl SimulatorHandle {
    pub(crate) fn new(handler: SimulatorHandler, plugin: Arc<LoadedPlugin>) -> Self {
        Self { handler, plugin }
    }

    pub fn plugin_id(&self) -> &str {
        self.plugin.plugin_id()
    }

    pub fn protocol_id(&self) -> String {
        self.handler.protocol_id().into_string()
    }

    /// Feed one packet; returns a frame once one is complete.
    pub fn handle_packet(&mut self, packet: &[u8]) -> Result<Option<FrameBuffer>, PluginError> {
        let handler = &mut self.handler;
        let result = call_plugin_safely(AssertUnwindSafe(|| {
            from_ffi(handler.handle_packet(packet)).map(|frame| frame.into_option())
        }));
        record(&self.plugin, result)
    }
}

impl std::fmt::Debug for SimulatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorHandle").field("plugin_id", &self.plugin_id()).finish()
    }
}

// =============================================================================
// Device transports (host -> plugin)
// =============================================================================

/// An open connection to a physical device.
pub trait DeviceTransport: Send {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

/// Opens transports for physical devices.
pub trait TransportProvider: Send + Sync {
    fn open(&self, descriptor: &HardwareDescriptor) -> std::io::Result<Box<dyn DeviceTransport>>;
}

/// Build the FFI opener for `provider`.
///
/// The opener borrows `provider`; it is valid only while that reference is,
/// which covers the `create_physical_driver` call it is passed to.
pub(crate) fn device_opener(provider: &&dyn TransportProvider) -> DeviceOpener {
    DeviceOpener {
        user_data: provider as *const &dyn TransportProvider as *const (),
        open: OpenTransportFn { func: open_transport },
    }
}

type BoxedTransport = Box<dyn DeviceTransport>;

extern "C" fn open_transport(user_data: *const (), descriptor: *const HardwareDescriptor) -> RResult<Transport, RString> {
    // SAFETY: user_data comes from device_opener and outlives the create call.
    let Some(provider) = (unsafe { (user_data as *const &dyn TransportProvider).as_ref() }) else {
        return RResult::RErr("device opener is no longer valid".into());
    };
    let Some(descriptor) = (unsafe { descriptor.as_ref() }) else {
        return RResult::RErr("missing hardware descriptor".into());
    };

    match catch_unwind(AssertUnwindSafe(|| provider.open(descriptor))) {
        Ok(Ok(transport)) => RResult::ROk(Transport {
            handle: ObjectHandle::new::<BoxedTransport>(transport),
            vtable: TransportVTable {
                write: transport_write,
                read: transport_read,
            },
        }),
        Ok(Err(e)) => RResult::RErr(format!("failed to open {}: {e}", descriptor.path).into()),
        Err(panic) => RResult::RErr(extract_panic_message(&panic).into()),
    }
}

extern "C" fn transport_write(handle: *mut ObjectHandle, data: *const u8, len: usize) -> FfiResult {
    // SAFETY: handle was created by open_transport with BoxedTransport.
    let Some(transport) = (unsafe { handle_state_mut::<BoxedTransport>(handle) }) else {
        return ffi_err("transport closed");
    };
    if data.is_null() && len > 0 {
        return ffi_err("null buffer");
    }
    let bytes = if len == 0 {
        &[][..]
    } else {
        // SAFETY: caller passes a buffer of `len` readable bytes.
        unsafe { std::slice::from_raw_parts(data, len) }
    };
    match catch_unwind(AssertUnwindSafe(|| transport.write(bytes))) {
        Ok(Ok(())) => ffi_ok(),
        Ok(Err(e)) => ffi_err(e.to_string()),
        Err(panic) => ffi_err(extract_panic_message(&panic)),
    }
}

extern "C" fn transport_read(
    handle: *mut ObjectHandle,
    buffer: *mut u8,
    capacity: usize,
    timeout_ms: u32,
) -> RResult<usize, RString> {
    // SAFETY: handle was created by open_transport with BoxedTransport.
    let Some(transport) = (unsafe { handle_state_mut::<BoxedTransport>(handle) }) else {
        return RResult::RErr("transport closed".into());
    };
    if buffer.is_null() || capacity == 0 {
        return RResult::ROk(0);
    }
    // SAFETY: caller passes a writable buffer of `capacity` bytes.
    let buffer = unsafe { std::slice::from_raw_parts_mut(buffer, capacity) };
    let timeout = Duration::from_millis(u64::from(timeout_ms));
    match catch_unwind(AssertUnwindSafe(|| transport.read(buffer, timeout))) {
        Ok(Ok(n)) => RResult::ROk(n),
        Ok(Err(e)) => RResult::RErr(e.to_string().into()),
        Err(panic) => RResult::RErr(extract_panic_message(&panic).into()),
    }
}
