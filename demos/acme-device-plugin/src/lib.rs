//! Acme Displays: demo device plugin for the LCD host
//!
//! Drives Acme 3.5" panels over USB (through the host transport) and their
//! network variant over UDP, and ships a simulator that decodes the same
//! wire protocol back into frames.
//!
//! # Wire protocol
//!
//! Every packet is `[0xA5, command, len_hi, len_lo, payload..]`:
//!
//! | command | payload                                   |
//! |---------|-------------------------------------------|
//! | `0x01`  | frame start: width, height (u16 BE), format |
//! | `0x02`  | frame data chunk                          |
//! | `0x03`  | frame end                                 |
//! | `0x10`  | brightness, 0-100                         |
//! | `0x11`  | orientation                               |
//!
//! # Building
//!
//! ```bash
//! cargo build --release -p lcd-demo-device-plugin
//! ```
//!
//! Copy `liblcd_demo_device_plugin.so` and `plugin.json` into a directory
//! under one of the host's plugin search paths.

use std::net::UdpSocket;

use lcd_plugin_api::{
    export_plugin, ffi_err, ffi_ok, handle_state, handle_state_mut, CommonVTable, DeviceDriver, DeviceOpener,
    DevicePluginVTable, DriverInfo, DriverVTable, FfiResult, FrameBuffer, HardwareDescriptor, LogLevel,
    NetworkEndpoint, ObjectHandle, Orientation, PixelFormat, PluginContext, PluginInfo, PluginInstance, PluginKind,
    ROption, RResult, RString, SimulatorHandler, SimulatorVTable, Transport,
};
use serde::Deserialize;

const PROTOCOL_ID: &str = "acme";
const VENDOR_ID: u16 = 0x0416;
const PRODUCT_ID: u16 = 0x5302;
const WIDTH: u32 = 320;
const HEIGHT: u32 = 480;

const MAGIC: u8 = 0xA5;
const HEADER_LEN: usize = 4;
const CMD_FRAME_START: u8 = 0x01;
const CMD_FRAME_DATA: u8 = 0x02;
const CMD_FRAME_END: u8 = 0x03;
const CMD_BRIGHTNESS: u8 = 0x10;
const CMD_ORIENTATION: u8 = 0x11;

#[derive(Deserialize)]
#[serde(default)]
struct Settings {
    /// Largest packet the firmware accepts, header included
    max_packet_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self { max_packet_size: 1024 }
    }
}

#[derive(Default)]
struct AcmePlugin {
    settings: Settings,
}

// =============================================================================
// Packet encoding
// =============================================================================

fn packet(command: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u16;
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&[MAGIC, command, (len >> 8) as u8, len as u8]);
    packet.extend_from_slice(payload);
    packet
}

fn format_code(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::Rgb565 => 0,
        PixelFormat::Rgb888 => 1,
        PixelFormat::Rgba8888 => 2,
        PixelFormat::Jpeg => 3,
    }
}

fn format_from_code(code: u8) -> Option<PixelFormat> {
    match code {
        0 => Some(PixelFormat::Rgb565),
        1 => Some(PixelFormat::Rgb888),
        2 => Some(PixelFormat::Rgba8888),
        3 => Some(PixelFormat::Jpeg),
        _ => None,
    }
}

/// Split a frame into start, data and end packets.
fn encode_frame(frame: &FrameBuffer, max_packet_size: usize) -> Vec<Vec<u8>> {
    let mut start = Vec::with_capacity(5);
    start.extend_from_slice(&(frame.width as u16).to_be_bytes());
    start.extend_from_slice(&(frame.height as u16).to_be_bytes());
    start.push(format_code(frame.format));

    let chunk = max_packet_size.saturating_sub(HEADER_LEN).max(1);
    let mut packets = vec![packet(CMD_FRAME_START, &start)];
    packets.extend(frame.data.chunks(chunk).map(|data| packet(CMD_FRAME_DATA, data)));
    packets.push(packet(CMD_FRAME_END, &[]));
    packets
}

// =============================================================================
// Driver
// =============================================================================

enum Link {
    Usb(Transport),
    Udp(UdpSocket),
}

impl Link {
    fn send(&mut self, packet: &[u8]) -> FfiResult {
        match self {
            Link::Usb(transport) => transport.write(packet),
            Link::Udp(socket) => match socket.send(packet) {
                Ok(_) => ffi_ok(),
                Err(e) => ffi_err(format!("udp send failed: {e}")),
            },
        }
    }
}

struct AcmeDriver {
    link: Link,
    name: &'static str,
    protocol_id: String,
    max_packet_size: usize,
}

fn driver(link: Link, name: &'static str, protocol_id: &str, max_packet_size: usize) -> DeviceDriver {
    DeviceDriver {
        handle: ObjectHandle::new(AcmeDriver {
            link,
            name,
            protocol_id: protocol_id.to_string(),
            max_packet_size,
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
    let (name, protocol_id) = match unsafe { handle_state::<AcmeDriver>(handle) } {
        Some(driver) => (driver.name, driver.protocol_id.as_str()),
        None => ("Acme", PROTOCOL_ID),
    };
    DriverInfo {
        name: name.into(),
        protocol_id: protocol_id.into(),
        width: WIDTH,
        height: HEIGHT,
        supports_brightness: true,
        supports_orientation: true,
    }
}

extern "C" fn driver_send_frame(handle: *mut ObjectHandle, frame: *const FrameBuffer) -> FfiResult {
    let Some(driver) = (unsafe { handle_state_mut::<AcmeDriver>(handle) }) else {
        return ffi_err("null driver handle");
    };
    let Some(frame) = (unsafe { frame.as_ref() }) else {
        return ffi_err("null frame");
    };
    if !frame.is_consistent() {
        return ffi_err(format!(
            "frame data is {} bytes, expected {:?} for {}x{}",
            frame.data.len(),
            frame.expected_len(),
            frame.width,
            frame.height
        ));
    }
    for packet in encode_frame(frame, driver.max_packet_size) {
        if let RResult::RErr(e) = driver.link.send(&packet) {
            return RResult::RErr(e);
        }
    }
    ffi_ok()
}

extern "C" fn driver_set_brightness(handle: *mut ObjectHandle, level: u8) -> FfiResult {
    let Some(driver) = (unsafe { handle_state_mut::<AcmeDriver>(handle) }) else {
        return ffi_err("null driver handle");
    };
    driver.link.send(&packet(CMD_BRIGHTNESS, &[level.min(100)]))
}

extern "C" fn driver_set_orientation(handle: *mut ObjectHandle, orientation: Orientation) -> FfiResult {
    let Some(driver) = (unsafe { handle_state_mut::<AcmeDriver>(handle) }) else {
        return ffi_err("null driver handle");
    };
    driver.link.send(&packet(CMD_ORIENTATION, &[orientation as u8]))
}

// =============================================================================
// Simulator
// =============================================================================

#[derive(Default)]
struct AcmeSimulator {
    header: Option<(u32, u32, PixelFormat)>,
    data: Vec<u8>,
}

extern "C" fn simulator_protocol_id(_handle: *const ObjectHandle) -> RString {
    PROTOCOL_ID.into()
}

extern "C" fn simulator_handle_packet(
    handle: *mut ObjectHandle,
    data: *const u8,
    len: usize,
) -> RResult<ROption<FrameBuffer>, RString> {
    let Some(simulator) = (unsafe { handle_state_mut::<AcmeSimulator>(handle) }) else {
        return RResult::RErr("null simulator handle".into());
    };
    if data.is_null() || len < HEADER_LEN {
        return RResult::RErr("packet shorter than header".into());
    }
    let bytes = unsafe { std::slice::from_raw_parts(data, len) };
    if bytes[0] != MAGIC {
        return RResult::RErr(format!("bad magic {:#04x}", bytes[0]).into());
    }
    let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != declared {
        return RResult::RErr(format!("payload is {} bytes, header says {declared}", payload.len()).into());
    }

    match bytes[1] {
        CMD_FRAME_START => {
            if payload.len() != 5 {
                return RResult::RErr("malformed frame start".into());
            }
            let width = u16::from_be_bytes([payload[0], payload[1]]) as u32;
            let height = u16::from_be_bytes([payload[2], payload[3]]) as u32;
            let Some(format) = format_from_code(payload[4]) else {
                return RResult::RErr(format!("unknown pixel format {}", payload[4]).into());
            };
            simulator.header = Some((width, height, format));
            simulator.data.clear();
            RResult::ROk(ROption::RNone)
        }
        CMD_FRAME_DATA => {
            if simulator.header.is_none() {
                return RResult::RErr("frame data before frame start".into());
            }
            simulator.data.extend_from_slice(payload);
            RResult::ROk(ROption::RNone)
        }
        CMD_FRAME_END => match simulator.header.take() {
            Some((width, height, format)) => {
                let data = std::mem::take(&mut simulator.data);
                RResult::ROk(ROption::RSome(FrameBuffer::new(width, height, format, data)))
            }
            None => RResult::RErr("frame end without frame start".into()),
        },
        CMD_BRIGHTNESS | CMD_ORIENTATION => RResult::ROk(ROption::RNone),
        other => RResult::RErr(format!("unknown command {other:#04x}").into()),
    }
}

// =============================================================================
// Plugin
// =============================================================================

extern "C" fn initialize(handle: *mut ObjectHandle, context: *const PluginContext) -> FfiResult {
    let Some(plugin) = (unsafe { handle_state_mut::<AcmePlugin>(handle) }) else {
        return ffi_err("null plugin handle");
    };
    let Some(context) = (unsafe { context.as_ref() }) else {
        return ffi_err("null context");
    };
    if let Some(settings) = context.settings::<Settings>() {
        plugin.settings = settings;
    }
    context.log(
        LogLevel::Info,
        format!("Acme displays ready, max packet {} bytes", plugin.settings.max_packet_size),
    );
    ffi_ok()
}

extern "C" fn teardown(_handle: *mut ObjectHandle) -> FfiResult {
    ffi_ok()
}

extern "C" fn supports_device(_handle: *const ObjectHandle, vendor_id: u16, product_id: u16) -> bool {
    vendor_id == VENDOR_ID && product_id == PRODUCT_ID
}

extern "C" fn supports_protocol(_handle: *const ObjectHandle, protocol_id: *const RString) -> bool {
    unsafe { protocol_id.as_ref() }.is_some_and(|p| p.as_str().eq_ignore_ascii_case(PROTOCOL_ID))
}

fn max_packet_size(handle: *const ObjectHandle) -> usize {
    unsafe { handle_state::<AcmePlugin>(handle) }
        .map(|p| p.settings.max_packet_size)
        .unwrap_or(Settings::default().max_packet_size)
}

extern "C" fn create_physical_driver(
    handle: *const ObjectHandle,
    descriptor: *const HardwareDescriptor,
    opener: DeviceOpener,
) -> RResult<ROption<DeviceDriver>, RString> {
    let Some(descriptor) = (unsafe { descriptor.as_ref() }) else {
        return RResult::RErr("null descriptor".into());
    };
    if !supports_device(handle, descriptor.vendor_id, descriptor.product_id) {
        return RResult::ROk(ROption::RNone);
    }
    match opener.open(descriptor) {
        RResult::ROk(transport) => RResult::ROk(ROption::RSome(driver(
            Link::Usb(transport),
            "Acme 3.5\" USB",
            PROTOCOL_ID,
            max_packet_size(handle),
        ))),
        RResult::RErr(e) => RResult::RErr(e),
    }
}

extern "C" fn create_virtual_driver(
    handle: *const ObjectHandle,
    protocol_id: *const RString,
    endpoint: *const NetworkEndpoint,
) -> RResult<ROption<DeviceDriver>, RString> {
    let (Some(protocol_id), Some(endpoint)) = (unsafe { protocol_id.as_ref() }, unsafe { endpoint.as_ref() }) else {
        return RResult::RErr("null argument".into());
    };
    let connected = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| socket.connect((endpoint.host.as_str(), endpoint.port)).map(|()| socket));
    match connected {
        Ok(socket) => RResult::ROk(ROption::RSome(driver(
            Link::Udp(socket),
            "Acme UDP",
            protocol_id.as_str(),
            max_packet_size(handle),
        ))),
        Err(e) => RResult::RErr(format!("cannot reach {}:{}: {e}", endpoint.host, endpoint.port).into()),
    }
}

extern "C" fn create_simulator_handler(
    _handle: *const ObjectHandle,
    protocol_id: *const RString,
) -> RResult<ROption<SimulatorHandler>, RString> {
    if !supports_protocol(std::ptr::null(), protocol_id) {
        return RResult::ROk(ROption::RNone);
    }
    RResult::ROk(ROption::RSome(SimulatorHandler {
        handle: ObjectHandle::new(AcmeSimulator::default()),
        vtable: SimulatorVTable {
            protocol_id: simulator_protocol_id,
            handle_packet: simulator_handle_packet,
        },
    }))
}

extern "C" fn create_plugin() -> RResult<PluginInstance, RString> {
    RResult::ROk(PluginInstance::device(
        ObjectHandle::new(AcmePlugin::default()),
        PluginInfo::new("com.acme.displays", "Acme Displays", env!("CARGO_PKG_VERSION")),
        CommonVTable { initialize, teardown },
        DevicePluginVTable {
            create_physical_driver,
            create_virtual_driver,
            create_simulator_handler,
            supports_device,
            supports_protocol,
        },
    ))
}

export_plugin!(PluginKind::Device => create_plugin);

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(simulator: &mut SimulatorHandler, packets: &[Vec<u8>]) -> Option<FrameBuffer> {
        let mut last = None;
        for packet in packets {
            match simulator.handle_packet(packet) {
                RResult::ROk(frame) => last = frame.into_option(),
                RResult::RErr(e) => panic!("simulator rejected packet: {e}"),
            }
        }
        last
    }

    #[test]
    fn test_simulator_decodes_driver_packets() {
        let frame = FrameBuffer::new(4, 2, PixelFormat::Rgb565, (0u8..16).collect::<Vec<_>>());
        let packets = encode_frame(&frame, 10);
        assert_eq!(packets.len(), 5);
        assert!(packets.iter().all(|p| p.len() <= 10));

        let protocol = RString::from("ACME");
        let mut simulator = match create_simulator_handler(std::ptr::null(), &protocol) {
            RResult::ROk(ROption::RSome(simulator)) => simulator,
            _ => panic!("no simulator for acme"),
        };
        let decoded = feed(&mut simulator, &packets).unwrap();
        assert_eq!((decoded.width, decoded.height), (4, 2));
        assert_eq!(decoded.format, PixelFormat::Rgb565);
        assert_eq!(decoded.data.as_slice(), frame.data.as_slice());
    }

    #[test]
    fn test_simulator_rejects_bad_packets() {
        let protocol = RString::from(PROTOCOL_ID);
        let mut simulator = match create_simulator_handler(std::ptr::null(), &protocol) {
            RResult::ROk(ROption::RSome(simulator)) => simulator,
            _ => panic!("no simulator for acme"),
        };
        assert!(simulator.handle_packet(&[0x00, 0x01, 0x00, 0x00]).is_err());
        assert!(simulator.handle_packet(&packet(CMD_FRAME_DATA, &[1, 2])).is_err());
        assert!(simulator.handle_packet(&packet(CMD_FRAME_END, &[])).is_err());
        assert!(simulator.handle_packet(&[MAGIC, CMD_FRAME_DATA, 0x00, 0x09, 1]).is_err());
    }

    #[test]
    fn test_other_protocols_have_no_simulator() {
        let protocol = RString::from("other");
        assert!(matches!(
            create_simulator_handler(std::ptr::null(), &protocol),
            RResult::ROk(ROption::RNone)
        ));
    }
}
