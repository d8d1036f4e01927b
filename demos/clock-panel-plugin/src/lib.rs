//! Clock Panels: demo panel plugin for the LCD host
//!
//! Provides two panel types:
//! - `clock`: the current time as `HH:MM` in large block digits
//! - `color`: a solid fill, addressed as `color:#rrggbb`
//!
//! Both render RGB565 frames at whatever size the host asks for.
//!
//! # Building
//!
//! ```bash
//! cargo build --release -p lcd-demo-panel-plugin
//! ```
//!
//! Copy `liblcd_demo_panel_plugin.so` and `plugin.json` into a directory
//! under one of the host's plugin search paths.

use std::time::{SystemTime, UNIX_EPOCH};

use lcd_plugin_api::{
    export_plugin, ffi_err, ffi_ok, handle_state, handle_state_mut, CommonVTable, FfiResult, FrameBuffer, LogLevel,
    ObjectHandle, Panel, PanelCreationContext, PanelPluginVTable, PanelTypeInfo, PanelVTable, PixelFormat,
    PluginContext, PluginInfo, PluginInstance, PluginKind, ROption, RResult, RString, RVec,
};
use serde::Deserialize;

/// 3x5 glyphs for `0`-`9` and `:`, one row per entry, MSB is the left column.
const GLYPHS: [[u8; 5]; 11] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b010, 0b010, 0b010],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
    [0b000, 0b010, 0b000, 0b010, 0b000],
];
const COLON: usize = 10;

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct PluginSettings {
    /// Offset applied when a panel does not set its own
    utc_offset_minutes: i32,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct ClockSettings {
    utc_offset_minutes: Option<i32>,
    color: Option<String>,
    background: Option<String>,
}

#[derive(Default)]
struct ClockPlugin {
    settings: PluginSettings,
}

// =============================================================================
// Drawing
// =============================================================================

/// Parse `#rrggbb` (or `rrggbb`) into RGB565.
fn parse_color(text: &str) -> Option<u16> {
    let hex = text.trim().trim_start_matches('#');
    if hex.len() != 6 {
        return None;
    }
    let rgb = u32::from_str_radix(hex, 16).ok()?;
    let (r, g, b) = ((rgb >> 16) & 0xff, (rgb >> 8) & 0xff, rgb & 0xff);
    Some((((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3)) as u16)
}

struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u16>,
}

impl Canvas {
    fn new(width: u32, height: u32, fill: u16) -> Self {
        Self {
            width,
            height,
            pixels: vec![fill; (width as usize) * (height as usize)],
        }
    }

    fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: u16) {
        for row in y..(y + h).min(self.height) {
            let start = (row * self.width) as usize;
            for col in x..(x + w).min(self.width) {
                self.pixels[start + col as usize] = color;
            }
        }
    }

    /// Draw glyph indices centered, scaled to fit.
    fn draw_text(&mut self, glyphs: &[usize], color: u16) {
        // Each glyph is 3 columns plus 1 column of spacing.
        let columns = (glyphs.len() * 4).saturating_sub(1) as u32;
        let scale = (self.width / (columns + 2)).min(self.height / 7).max(1);
        let x0 = self.width.saturating_sub(columns * scale) / 2;
        let y0 = self.height.saturating_sub(5 * scale) / 2;

        for (i, &glyph) in glyphs.iter().enumerate() {
            let gx = x0 + (i as u32) * 4 * scale;
            for (row, bits) in GLYPHS[glyph].iter().enumerate() {
                for col in 0..3u32 {
                    if bits & (0b100 >> col) != 0 {
                        self.fill_rect(gx + col * scale, y0 + row as u32 * scale, scale, scale, color);
                    }
                }
            }
        }
    }

    fn into_frame(self) -> FrameBuffer {
        let data: Vec<u8> = self.pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
        FrameBuffer::new(self.width, self.height, PixelFormat::Rgb565, data)
    }
}

fn clock_glyphs(unix_seconds: i64, offset_minutes: i32) -> [usize; 5] {
    let local = unix_seconds + i64::from(offset_minutes) * 60;
    let minutes_of_day = local.rem_euclid(86_400) / 60;
    let (hours, minutes) = ((minutes_of_day / 60) as usize, (minutes_of_day % 60) as usize);
    [hours / 10, hours % 10, COLON, minutes / 10, minutes % 10]
}

// =============================================================================
// Panels
// =============================================================================

enum PanelState {
    Clock {
        offset_minutes: i32,
        color: u16,
        background: u16,
        glyphs: [usize; 5],
    },
    Solid {
        color: u16,
    },
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

extern "C" fn panel_update(handle: *mut ObjectHandle) -> FfiResult {
    let Some(state) = (unsafe { handle_state_mut::<PanelState>(handle) }) else {
        return ffi_err("null panel handle");
    };
    if let PanelState::Clock {
        offset_minutes, glyphs, ..
    } = state
    {
        *glyphs = clock_glyphs(now_seconds(), *offset_minutes);
    }
    ffi_ok()
}

extern "C" fn panel_render(handle: *mut ObjectHandle, width: u32, height: u32) -> RResult<FrameBuffer, RString> {
    let Some(state) = (unsafe { handle_state_mut::<PanelState>(handle) }) else {
        return RResult::RErr("null panel handle".into());
    };
    if width == 0 || height == 0 {
        return RResult::RErr(format!("cannot render {width}x{height}").into());
    }
    let frame = match state {
        PanelState::Clock {
            color,
            background,
            glyphs,
            ..
        } => {
            let mut canvas = Canvas::new(width, height, *background);
            canvas.draw_text(glyphs, *color);
            canvas.into_frame()
        }
        PanelState::Solid { color } => Canvas::new(width, height, *color).into_frame(),
    };
    RResult::ROk(frame)
}

fn panel(state: PanelState) -> Panel {
    Panel {
        handle: ObjectHandle::new(state),
        vtable: PanelVTable {
            update: panel_update,
            render: panel_render,
        },
    }
}

extern "C" fn panel_types(_handle: *const ObjectHandle) -> RVec<PanelTypeInfo> {
    RVec::from(vec![
        PanelTypeInfo {
            type_id: "clock".into(),
            display_name: "Digital Clock".into(),
            prefix_pattern: ROption::RNone,
            is_live: true,
            is_animated: false,
        },
        PanelTypeInfo {
            type_id: "color".into(),
            display_name: "Solid Color".into(),
            prefix_pattern: ROption::RSome("color:".into()),
            is_live: false,
            is_animated: false,
        },
    ])
}

extern "C" fn create_panel(
    handle: *const ObjectHandle,
    type_id: *const RString,
    context: *const PanelCreationContext,
) -> RResult<ROption<Panel>, RString> {
    let (Some(type_id), Some(context)) = (unsafe { type_id.as_ref() }, unsafe { context.as_ref() }) else {
        return RResult::RErr("null argument".into());
    };

    match type_id.as_str() {
        "clock" => {
            let settings: ClockSettings = serde_json::from_str(context.settings_json.as_str()).unwrap_or_default();
            let default_offset = unsafe { handle_state::<ClockPlugin>(handle) }
                .map(|p| p.settings.utc_offset_minutes)
                .unwrap_or(0);
            let offset_minutes = settings.utc_offset_minutes.unwrap_or(default_offset);
            let color = settings.color.as_deref().and_then(parse_color).unwrap_or(0xffff);
            let background = settings.background.as_deref().and_then(parse_color).unwrap_or(0x0000);
            RResult::ROk(ROption::RSome(panel(PanelState::Clock {
                offset_minutes,
                color,
                background,
                glyphs: clock_glyphs(now_seconds(), offset_minutes),
            })))
        }
        "color" => {
            let argument = context.argument.as_ref().into_option().map(RString::as_str).unwrap_or("#000000");
            match parse_color(argument) {
                Some(color) => RResult::ROk(ROption::RSome(panel(PanelState::Solid { color }))),
                None => RResult::RErr(format!("invalid color '{argument}', expected #rrggbb").into()),
            }
        }
        _ => RResult::ROk(ROption::RNone),
    }
}

// =============================================================================
// Plugin
// =============================================================================

extern "C" fn initialize(handle: *mut ObjectHandle, context: *const PluginContext) -> FfiResult {
    let Some(plugin) = (unsafe { handle_state_mut::<ClockPlugin>(handle) }) else {
        return ffi_err("null plugin handle");
    };
    let Some(context) = (unsafe { context.as_ref() }) else {
        return ffi_err("null context");
    };
    if let Some(settings) = context.settings::<PluginSettings>() {
        plugin.settings = settings;
    }
    context.log(
        LogLevel::Debug,
        format!("clock panels using UTC offset {} minutes", plugin.settings.utc_offset_minutes),
    );
    ffi_ok()
}

extern "C" fn teardown(_handle: *mut ObjectHandle) -> FfiResult {
    ffi_ok()
}

extern "C" fn create_plugin() -> RResult<PluginInstance, RString> {
    RResult::ROk(PluginInstance::panel(
        ObjectHandle::new(ClockPlugin::default()),
        PluginInfo::new("com.example.clock", "Clock Panels", env!("CARGO_PKG_VERSION")),
        CommonVTable { initialize, teardown },
        PanelPluginVTable {
            panel_types,
            create_panel,
        },
    ))
}

export_plugin!(PluginKind::Panel => create_plugin);
