//! In-process test plugins and fixture helpers shared by the integration tests.
//!
//! The plugins here are built on `lcd-plugin-api` exactly like a cdylib
//! plugin would be, but are registered with a `StaticModuleLoader` under a
//! file name instead of being loaded from disk. Lifecycle events are counted
//! per plugin id so tests running in parallel do not see each other.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use lcd_host::plugin::loader::{StaticModuleLoader, library_file_name};
use lcd_host::plugin::runtime::{PluginRuntime, RuntimeKind};
use lcd_host::plugin::search_paths::SearchPath;
use lcd_plugin_api::{
    CommonVTable, DeviceDriver, DeviceOpener, DevicePluginVTable, DriverInfo, DriverVTable, FfiResult, FrameBuffer,
    HardwareDescriptor, HostCallbacks, LogLevel, NetworkEndpoint, ObjectHandle, Orientation, Panel, PanelCreationContext,
    PanelPluginVTable, PanelTypeInfo, PanelVTable, PixelFormat, PluginContext, PluginExport, PluginInfo,
    PluginInstance, PluginKind, PluginModule, ROption, RResult, RString, RVec, SimulatorHandler, SimulatorVTable,
    Transport, ffi_err, ffi_ok, handle_state, handle_state_mut,
};

// =============================================================================
// Event counters
// =============================================================================

static EVENTS: LazyLock<Mutex<HashMap<(String, &'static str), usize>>> = LazyLock::new(Default::default);
static SETTINGS_SEEN: LazyLock<Mutex<HashMap<String, serde_json::Value>>> = LazyLock::new(Default::default);
static RELEASE_LOOKUPS: LazyLock<Mutex<HashMap<String, Option<String>>>> = LazyLock::new(Default::default);

fn record(plugin_id: &str, event: &'static str) {
    *EVENTS
        .lock()
        .unwrap()
        .entry((plugin_id.to_lowercase(), event))
        .or_default() += 1;
}

fn count(plugin_id: &str, event: &'static str) -> usize {
    EVENTS
        .lock()
        .unwrap()
        .get(&(plugin_id.to_lowercase(), event))
        .copied()
        .unwrap_or(0)
}

/// Times `initialize` ran for a plugin id.
pub fn initializations(plugin_id: &str) -> usize {
    count(plugin_id, "initialize")
}

/// Times `teardown` ran for a plugin id.
pub fn teardowns(plugin_id: &str) -> usize {
    count(plugin_id, "teardown")
}

/// Settings the plugin received through the host service at initialize.
pub fn settings_seen(plugin_id: &str) -> Option<serde_json::Value> {
    SETTINGS_SEEN.lock().unwrap().get(&plugin_id.to_lowercase()).cloned()
}

/// Runtime version the plugin resolved through its saved host callbacks
/// while its state was being dropped.
pub fn version_seen_on_release(plugin_id: &str) -> Option<Option<String>> {
    RELEASE_LOOKUPS.lock().unwrap().get(&plugin_id.to_lowercase()).cloned()
}

// =============================================================================
// Plugin instance (both kinds)
// =============================================================================

#[derive(Default)]
struct TestPlugin {
    plugin_id: Option<String>,
    init_delay: Duration,
    fail_init: bool,
    /// Host callbacks kept from `initialize`, used again on drop
    host: Option<(String, HostCallbacks)>,
}

impl Drop for TestPlugin {
    fn drop(&mut self) {
        if let Some((plugin_id, host)) = self.host.take() {
            host.log(LogLevel::Debug, "releasing plugin state");
            let version = host.resolve_service("runtime.version");
            RELEASE_LOOKUPS.lock().unwrap().insert(plugin_id.to_lowercase(), version);
        }
    }
}

extern "C" fn initialize(handle: *mut ObjectHandle, context: *const PluginContext) -> FfiResult {
    let Some(state) = (unsafe { handle_state_mut::<TestPlugin>(handle) }) else {
        return ffi_err("null handle");
    };
    let Some(context) = (unsafe { context.as_ref() }) else {
        return ffi_err("null context");
    };
    let plugin_id = context.plugin_id.to_string();
    record(&plugin_id, "initialize");
    state.host = Some((plugin_id.clone(), context.host));

    if !state.init_delay.is_zero() {
        std::thread::sleep(state.init_delay);
    }
    if state.fail_init {
        return ffi_err("device database unavailable");
    }
    if let Some(settings) = context.settings::<serde_json::Value>() {
        SETTINGS_SEEN.lock().unwrap().insert(plugin_id.to_lowercase(), settings);
    }
    context.log(LogLevel::Info, format!("initialized from {}", context.plugin_dir));
    state.plugin_id = Some(plugin_id);
    ffi_ok()
}

extern "C" fn teardown(handle: *mut ObjectHandle) -> FfiResult {
    let Some(state) = (unsafe { handle_state_mut::<TestPlugin>(handle) }) else {
        return ffi_err("null handle");
    };
    if let Some(plugin_id) = state.plugin_id.take() {
        record(&plugin_id, "teardown");
    }
    ffi_ok()
}

fn common() -> CommonVTable {
    CommonVTable { initialize, teardown }
}

fn info() -> PluginInfo {
    PluginInfo::new("test.plugin", "Test Plugin", "1.0.0")
}

// =============================================================================
// Panel plugin
// =============================================================================

struct TestPanel {
    argument: Option<String>,
    updates: u32,
}

extern "C" fn panel_types(_handle: *const ObjectHandle) -> RVec<PanelTypeInfo> {
    RVec::from(vec![
        PanelTypeInfo {
            type_id: "clock".into(),
            display_name: "Clock".into(),
            prefix_pattern: ROption::RNone,
            is_live: true,
            is_animated: false,
        },
        PanelTypeInfo {
            type_id: "video".into(),
            display_name: "Video".into(),
            prefix_pattern: ROption::RSome("video:".into()),
            is_live: false,
            is_animated: true,
        },
    ])
}

extern "C" fn create_panel(
    _handle: *const ObjectHandle,
    type_id: *const RString,
    context: *const PanelCreationContext,
) -> RResult<ROption<Panel>, RString> {
    let (Some(type_id), Some(context)) = (unsafe { type_id.as_ref() }, unsafe { context.as_ref() }) else {
        return RResult::RErr("null argument".into());
    };
    match type_id.as_str() {
        "clock" | "video" => {
            let panel = TestPanel {
                argument: context.argument.clone().into_option().map(RString::into_string),
                updates: 0,
            };
            RResult::ROk(ROption::RSome(Panel {
                handle: ObjectHandle::new(panel),
                vtable: PanelVTable {
                    update: panel_update,
                    render: panel_render,
                },
            }))
        }
        "broken" => RResult::RErr("panel source unavailable".into()),
        _ => RResult::ROk(ROption::RNone),
    }
}

extern "C" fn panel_update(handle: *mut ObjectHandle) -> FfiResult {
    let Some(panel) = (unsafe { handle_state_mut::<TestPanel>(handle) }) else {
        return ffi_err("null handle");
    };
    panel.updates += 1;
    ffi_ok()
}

/// Renders the panel argument as an encoded frame, or a blank raw frame.
extern "C" fn panel_render(handle: *mut ObjectHandle, width: u32, height: u32) -> RResult<FrameBuffer, RString> {
    let Some(panel) = (unsafe { handle_state::<TestPanel>(handle) }) else {
        return RResult::RErr("null handle".into());
    };
    match &panel.argument {
        Some(argument) => RResult::ROk(FrameBuffer::new(width, height, PixelFormat::Jpeg, argument.as_bytes().to_vec())),
        None => RResult::ROk(FrameBuffer::blank(width, height, PixelFormat::Rgb565)),
    }
}

fn panel_instance(state: TestPlugin) -> RResult<PluginInstance, RString> {
    RResult::ROk(PluginInstance::panel(
        ObjectHandle::new(state),
        info(),
        common(),
        PanelPluginVTable {
            panel_types,
            create_panel,
        },
    ))
}

extern "C" fn create_panel_plugin() -> RResult<PluginInstance, RString> {
    panel_instance(TestPlugin::default())
}

extern "C" fn create_slow_panel_plugin() -> RResult<PluginInstance, RString> {
    let mut state = TestPlugin::default();
    state.init_delay = Duration::from_millis(150);
    panel_instance(state)
}

extern "C" fn create_failing_panel_plugin() -> RResult<PluginInstance, RString> {
    let mut state = TestPlugin::default();
    state.fail_init = true;
    panel_instance(state)
}

extern "C" fn create_refusing_plugin() -> RResult<PluginInstance, RString> {
    RResult::RErr("license check failed".into())
}

// =============================================================================
// Device plugin
// =============================================================================

pub const ACME_VENDOR_ID: u16 = 0x0416;
pub const ACME_PRODUCT_ID: u16 = 0x5302;
pub const ACME_PROTOCOL: &str = "acme";

struct TestDriver {
    transport: Option<Transport>,
    protocol_id: String,
    brightness: u8,
    orientation: Orientation,
}

fn driver(transport: Option<Transport>, protocol_id: &str) -> DeviceDriver {
    DeviceDriver {
        handle: ObjectHandle::new(TestDriver {
            transport,
            protocol_id: protocol_id.to_string(),
            brightness: 100,
            orientation: Orientation::Landscape,
        }),
        vtable: DriverVTable {
            info: driver_info,
            send_frame: driver_send_frame,
            set_brightness: driver_set_brightness,
            set_orientation: driver_set_orientation,
        },
    }
}

extern "C" fn driver_info(handle: *const ObjectHandle) -> DriverInfo {
    let protocol_id = unsafe { handle_state::<TestDriver>(handle) }
        .map(|d| d.protocol_id.clone())
        .unwrap_or_default();
    DriverInfo {
        name: "Acme 3.5\" USB".into(),
        protocol_id: protocol_id.into(),
        width: 320,
        height: 480,
        supports_brightness: true,
        supports_orientation: true,
    }
}

/// Writes a two-byte header `[0xA5, frame count]` followed by the frame data.
extern "C" fn driver_send_frame(handle: *mut ObjectHandle, frame: *const FrameBuffer) -> FfiResult {
    let (Some(driver), Some(frame)) = (unsafe { handle_state_mut::<TestDriver>(handle) }, unsafe { frame.as_ref() })
    else {
        return ffi_err("null argument");
    };
    if !frame.is_consistent() {
        return ffi_err("frame size does not match dimensions");
    }
    let Some(transport) = driver.transport.as_mut() else {
        return ffi_ok();
    };
    let mut packet = vec![0xA5, frame.width as u8];
    packet.extend_from_slice(&frame.data);
    transport.write(&packet)
}

extern "C" fn driver_set_brightness(handle: *mut ObjectHandle, level: u8) -> FfiResult {
    let Some(driver) = (unsafe { handle_state_mut::<TestDriver>(handle) }) else {
        return ffi_err("null handle");
    };
    driver.brightness = level;
    ffi_ok()
}

extern "C" fn driver_set_orientation(handle: *mut ObjectHandle, orientation: Orientation) -> FfiResult {
    let Some(driver) = (unsafe { handle_state_mut::<TestDriver>(handle) }) else {
        return ffi_err("null handle");
    };
    if orientation == Orientation::PortraitFlipped {
        return ffi_err("orientation not supported by firmware");
    }
    driver.orientation = orientation;
    ffi_ok()
}

struct TestSimulator {
    pending: Vec<u8>,
}

/// `0x01 ..data` appends data; `0x02` completes a frame.
extern "C" fn simulator_handle_packet(
    handle: *mut ObjectHandle,
    data: *const u8,
    len: usize,
) -> RResult<ROption<FrameBuffer>, RString> {
    let Some(simulator) = (unsafe { handle_state_mut::<TestSimulator>(handle) }) else {
        return RResult::RErr("null handle".into());
    };
    if data.is_null() || len == 0 {
        return RResult::RErr("empty packet".into());
    }
    let packet = unsafe { std::slice::from_raw_parts(data, len) };
    match packet[0] {
        0x01 => {
            simulator.pending.extend_from_slice(&packet[1..]);
            RResult::ROk(ROption::RNone)
        }
        0x02 => {
            let data = std::mem::take(&mut simulator.pending);
            RResult::ROk(ROption::RSome(FrameBuffer::new(0, 0, PixelFormat::Jpeg, data)))
        }
        other => RResult::RErr(format!("unknown packet type {other:#04x}").into()),
    }
}

extern "C" fn simulator_protocol_id(_handle: *const ObjectHandle) -> RString {
    ACME_PROTOCOL.into()
}

extern "C" fn supports_device(_handle: *const ObjectHandle, vendor_id: u16, product_id: u16) -> bool {
    vendor_id == ACME_VENDOR_ID && product_id == ACME_PRODUCT_ID
}

extern "C" fn supports_protocol(_handle: *const ObjectHandle, protocol_id: *const RString) -> bool {
    unsafe { protocol_id.as_ref() }.is_some_and(|p| p.as_str().eq_ignore_ascii_case(ACME_PROTOCOL))
}

extern "C" fn create_physical_driver(
    _handle: *const ObjectHandle,
    descriptor: *const HardwareDescriptor,
    opener: DeviceOpener,
) -> RResult<ROption<DeviceDriver>, RString> {
    let Some(descriptor) = (unsafe { descriptor.as_ref() }) else {
        return RResult::RErr("null descriptor".into());
    };
    match opener.open(descriptor) {
        RResult::ROk(transport) => RResult::ROk(ROption::RSome(driver(Some(transport), ACME_PROTOCOL))),
        RResult::RErr(e) => RResult::RErr(e),
    }
}

extern "C" fn create_virtual_driver(
    _handle: *const ObjectHandle,
    protocol_id: *const RString,
    endpoint: *const NetworkEndpoint,
) -> RResult<ROption<DeviceDriver>, RString> {
    let (Some(protocol_id), Some(endpoint)) = (unsafe { protocol_id.as_ref() }, unsafe { endpoint.as_ref() }) else {
        return RResult::RErr("null argument".into());
    };
    if endpoint.port == 0 {
        return RResult::RErr("endpoint port must be set".into());
    }
    RResult::ROk(ROption::RSome(driver(None, protocol_id.as_str())))
}

extern "C" fn create_simulator_handler(
    _handle: *const ObjectHandle,
    protocol_id: *const RString,
) -> RResult<ROption<SimulatorHandler>, RString> {
    let matches = unsafe { protocol_id.as_ref() }.is_some_and(|p| p.as_str() == ACME_PROTOCOL);
    if !matches {
        return RResult::ROk(ROption::RNone);
    }
    RResult::ROk(ROption::RSome(SimulatorHandler {
        handle: ObjectHandle::new(TestSimulator { pending: Vec::new() }),
        vtable: SimulatorVTable {
            protocol_id: simulator_protocol_id,
            handle_packet: simulator_handle_packet,
        },
    }))
}

extern "C" fn create_device_plugin() -> RResult<PluginInstance, RString> {
    RResult::ROk(PluginInstance::device(
        ObjectHandle::new(TestPlugin::default()),
        info(),
        common(),
        DevicePluginVTable {
            create_physical_driver,
            create_virtual_driver,
            create_simulator_handler,
            supports_device,
            supports_protocol,
        },
    ))
}

// =============================================================================
// Module entry points
// =============================================================================

fn module(exports: &[(PluginKind, extern "C" fn() -> RResult<PluginInstance, RString>)]) -> PluginModule {
    PluginModule::new(
        exports
            .iter()
            .map(|&(kind, create)| PluginExport { kind, create })
            .collect(),
    )
}

extern "C" fn panel_entry() -> PluginModule {
    module(&[(PluginKind::Panel, create_panel_plugin)])
}

extern "C" fn slow_panel_entry() -> PluginModule {
    module(&[(PluginKind::Panel, create_slow_panel_plugin)])
}

extern "C" fn failing_panel_entry() -> PluginModule {
    module(&[(PluginKind::Panel, create_failing_panel_plugin)])
}

extern "C" fn refusing_panel_entry() -> PluginModule {
    module(&[(PluginKind::Panel, create_refusing_plugin)])
}

extern "C" fn device_entry() -> PluginModule {
    module(&[(PluginKind::Device, create_device_plugin)])
}

extern "C" fn empty_entry() -> PluginModule {
    module(&[])
}

extern "C" fn double_panel_entry() -> PluginModule {
    module(&[
        (PluginKind::Panel, create_panel_plugin),
        (PluginKind::Panel, create_slow_panel_plugin),
    ])
}

extern "C" fn mixed_entry() -> PluginModule {
    module(&[
        (PluginKind::Device, create_device_plugin),
        (PluginKind::Panel, create_panel_plugin),
    ])
}

extern "C" fn future_abi_entry() -> PluginModule {
    let mut module = module(&[(PluginKind::Panel, create_panel_plugin)]);
    module.abi_version.major += 1;
    module
}

pub const PANEL_MODULE: &str = "libpanel.so";
pub const SLOW_PANEL_MODULE: &str = "libslow_panel.so";
pub const FAILING_PANEL_MODULE: &str = "libfailing_panel.so";
pub const REFUSING_PANEL_MODULE: &str = "librefusing_panel.so";
pub const DEVICE_MODULE: &str = "libacme_device.so";
pub const EMPTY_MODULE: &str = "libempty.so";
pub const DOUBLE_PANEL_MODULE: &str = "libdouble_panel.so";
pub const MIXED_MODULE: &str = "libmixed.so";
pub const FUTURE_ABI_MODULE: &str = "libfuture_abi.so";
/// Private dependency name resolved to a platform file name in the plugin directory.
pub const HELPER_LIBRARY: &str = "helper";

/// A loader serving every test module.
pub fn test_loader() -> Arc<StaticModuleLoader> {
    let loader = StaticModuleLoader::new();
    loader
        .register(PANEL_MODULE, panel_entry)
        .register(SLOW_PANEL_MODULE, slow_panel_entry)
        .register(FAILING_PANEL_MODULE, failing_panel_entry)
        .register(REFUSING_PANEL_MODULE, refusing_panel_entry)
        .register(DEVICE_MODULE, device_entry)
        .register(EMPTY_MODULE, empty_entry)
        .register(DOUBLE_PANEL_MODULE, double_panel_entry)
        .register(MIXED_MODULE, mixed_entry)
        .register(FUTURE_ABI_MODULE, future_abi_entry)
        .register_library(&library_file_name(HELPER_LIBRARY).to_string_lossy());
    Arc::new(loader)
}

/// Build a runtime over `paths` backed by `loader`.
pub fn runtime<K: RuntimeKind>(paths: Vec<SearchPath>, loader: &Arc<StaticModuleLoader>) -> PluginRuntime<K> {
    PluginRuntime::<K>::builder()
        .search_paths(paths)
        .loader(loader.clone())
        .build()
}

// =============================================================================
// Manifests on disk
// =============================================================================

/// Write `plugin.json` into `root/dir`, returning the plugin directory.
pub fn write_plugin(root: &Path, dir: &str, manifest: &serde_json::Value) -> PathBuf {
    let plugin_dir = root.join(dir);
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(
        plugin_dir.join("plugin.json"),
        serde_json::to_vec_pretty(manifest).unwrap(),
    )
    .unwrap();
    plugin_dir
}

/// Panel manifest providing `clock` and `video` (prefix `video:`).
pub fn panel_manifest(id: &str, module: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "panel",
        "name": "Media Panels",
        "version": "1.0.0",
        "author": "Test",
        "minimumSdkVersion": "1.0.0",
        "assemblyName": module,
        "panelTypes": [
            { "typeId": "clock", "displayName": "Clock", "isLive": true },
            { "typeId": "video", "displayName": "Video", "prefixPattern": "video:", "isAnimated": true },
            { "typeId": "broken", "displayName": "Broken" }
        ]
    })
}

/// Device manifest for the Acme panel and its protocol.
pub fn device_manifest(id: &str, version: &str, default_port: u16) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "device",
        "name": "Acme Displays",
        "version": version,
        "author": "Acme",
        "minimumSdkVersion": "1.0.0",
        "assemblyName": DEVICE_MODULE,
        "devices": [
            {
                "vendorId": "0x0416",
                "productId": "0x5302",
                "displayName": "Acme 3.5\"",
                "protocolId": ACME_PROTOCOL,
                "width": 320,
                "height": 480
            }
        ],
        "protocols": [
            {
                "protocolId": ACME_PROTOCOL,
                "displayName": "Acme UDP",
                "defaultPort": default_port,
                "width": 320,
                "height": 480,
                "supportsBrightness": true
            }
        ]
    })
}
