//! Plugin Manifest Model
//!
//! Typed representation of a plugin's `plugin.json`: identity, version,
//! entry module location and the capability list for its kind.
//!
//! Parsing is deliberately lenient where it can be. Field names are matched
//! case-insensitively, unknown fields are ignored, and malformed version
//! strings fall back to `1.0.0` so an otherwise valid plugin can still be
//! cataloged. Structural problems (missing id, missing entry module, garbage
//! hardware ids) are hard errors.

use lcd_plugin_api::PluginKind;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Manifest file name looked up in each plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Error that prevents a manifest from being used at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManifestError {
    /// Not valid JSON, or a field has the wrong JSON type
    #[error("Failed to parse manifest JSON: {0}")]
    Json(String),

    /// A required field is absent or empty
    #[error("Manifest field '{0}' is missing or empty")]
    MissingField(&'static str),

    /// A vendor/product id is neither hex nor decimal, or out of range
    #[error("Invalid hardware id for '{field}': {value}")]
    InvalidHardwareId { field: &'static str, value: String },

    /// A capability declares an empty routing key
    #[error("Capability in '{0}' has an empty key")]
    EmptyCapabilityKey(&'static str),
}

impl From<serde_json::Error> for ManifestError {
    fn from(err: serde_json::Error) -> Self {
        ManifestError::Json(err.to_string())
    }
}

/// Non-fatal observation made while parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestWarning {
    /// `type` was absent or not one of `device`/`panel`; treated as panel
    #[error("Unrecognized plugin type '{0}', defaulting to panel")]
    UnrecognizedKind(String),

    /// A version string could not be parsed; treated as 1.0.0
    #[error("Invalid {field} '{value}', falling back to 1.0.0")]
    InvalidVersion { field: &'static str, value: String },
}

/// A physical device served by a device plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapability {
    pub vendor_id: u16,
    pub product_id: u16,
    pub display_name: String,
    pub protocol_id: String,
    pub width: u32,
    pub height: u32,
}

/// A protocol usable by virtual or simulated devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCapability {
    pub protocol_id: String,
    pub display_name: String,
    pub default_port: u16,
    pub width: u32,
    pub height: u32,
    pub max_packet_size: u32,
    pub max_frame_rate: u32,
    pub supports_brightness: bool,
    pub supports_orientation: bool,
}

/// A configurable parameter of a panel type.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelParameter {
    pub name: String,
    pub kind: String,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
}

/// A panel type provided by a panel plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelTypeCapability {
    pub type_id: String,
    pub display_name: String,
    /// Input prefix such as `video:`; the remainder is the panel argument
    pub prefix_pattern: Option<String>,
    pub category: String,
    pub is_live: bool,
    pub is_animated: bool,
    pub description: String,
    pub parameters: Vec<PanelParameter>,
}

/// Kind-dependent capability list.
#[derive(Debug, Clone, PartialEq)]
pub enum Capabilities {
    Device {
        devices: Vec<DeviceCapability>,
        protocols: Vec<ProtocolCapability>,
    },
    Panel {
        panel_types: Vec<PanelTypeCapability>,
    },
}

/// Parsed `plugin.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    /// Reverse-domain identifier, unique (case-insensitively) per runtime
    pub id: String,
    pub kind: PluginKind,
    pub name: String,
    pub version: semver::Version,
    pub author: String,
    pub description: Option<String>,
    /// Oldest runtime version the plugin accepts
    pub minimum_runtime_version: semver::Version,
    /// Entry module file, relative to the manifest directory
    pub entry_module: String,
    /// Extra modules resolved through the plugin's boundary before the entry module
    pub dependencies: Vec<String>,
    pub capabilities: Capabilities,
}

impl PluginManifest {
    /// Parse a manifest, discarding warnings.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        Self::parse_with_warnings(bytes).map(|(manifest, _)| manifest)
    }

    /// Parse a manifest and report non-fatal observations.
    pub fn parse_with_warnings(bytes: &[u8]) -> Result<(Self, Vec<ManifestWarning>), ManifestError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let raw: RawManifest = serde_json::from_value(fold_keys(value))?;
        let mut warnings = Vec::new();

        let id = non_empty(raw.id).ok_or(ManifestError::MissingField("id"))?;
        let entry_module =
            non_empty(raw.assembly_name).ok_or(ManifestError::MissingField("assemblyName"))?;

        let kind = match raw.kind.as_deref().map(|k| k.trim().to_ascii_lowercase()) {
            Some(k) if k == "device" => PluginKind::Device,
            Some(k) if k == "panel" => PluginKind::Panel,
            other => {
                warnings.push(ManifestWarning::UnrecognizedKind(other.unwrap_or_default()));
                PluginKind::Panel
            }
        };

        let version = parse_version_field("version", raw.version.as_deref(), &mut warnings);
        let minimum_runtime_version =
            parse_version_field("minimumSdkVersion", raw.minimum_sdk_version.as_deref(), &mut warnings);

        let capabilities = match kind {
            PluginKind::Device => Capabilities::Device {
                devices: raw
                    .devices
                    .into_iter()
                    .map(RawDevice::into_capability)
                    .collect::<Result<_, _>>()?,
                protocols: raw
                    .protocols
                    .into_iter()
                    .map(RawProtocol::into_capability)
                    .collect::<Result<_, _>>()?,
            },
            PluginKind::Panel => Capabilities::Panel {
                panel_types: raw
                    .panel_types
                    .into_iter()
                    .map(RawPanelType::into_capability)
                    .collect::<Result<_, _>>()?,
            },
        };

        let manifest = Self {
            name: non_empty(raw.name).unwrap_or_else(|| id.clone()),
            id,
            kind,
            version,
            author: raw.author.unwrap_or_default(),
            description: non_empty(raw.description),
            minimum_runtime_version,
            entry_module,
            dependencies: raw.dependencies.into_iter().filter(|d| !d.trim().is_empty()).collect(),
            capabilities,
        };

        Ok((manifest, warnings))
    }

    /// Devices declared by a device plugin (empty for panels).
    pub fn devices(&self) -> &[DeviceCapability] {
        match &self.capabilities {
            Capabilities::Device { devices, .. } => devices,
            Capabilities::Panel { .. } => &[],
        }
    }

    /// Protocols declared by a device plugin (empty for panels).
    pub fn protocols(&self) -> &[ProtocolCapability] {
        match &self.capabilities {
            Capabilities::Device { protocols, .. } => protocols,
            Capabilities::Panel { .. } => &[],
        }
    }

    /// Panel types declared by a panel plugin (empty for devices).
    pub fn panel_types(&self) -> &[PanelTypeCapability] {
        match &self.capabilities {
            Capabilities::Panel { panel_types } => panel_types,
            Capabilities::Device { .. } => &[],
        }
    }

    /// Number of declared capabilities.
    pub fn capability_count(&self) -> usize {
        self.devices().len() + self.protocols().len() + self.panel_types().len()
    }

    /// Lowercased id used as the catalog key.
    pub fn key(&self) -> String {
        self.id.to_lowercase()
    }
}

/// Compare two versions as plain `(major, minor, patch)` triples.
///
/// Pre-release and build metadata are ignored.
pub fn version_satisfies(minimum: &semver::Version, current: &semver::Version) -> bool {
    (minimum.major, minimum.minor, minimum.patch) <= (current.major, current.minor, current.patch)
}

/// Parse a version leniently.
///
/// Accepts strict semver, then `major[.minor[.patch[.build]]]` with numeric
/// components. Returns `None` for anything else.
pub fn parse_version_lenient(input: &str) -> Option<semver::Version> {
    let trimmed = input.trim().trim_start_matches(['v', 'V']);
    if let Ok(version) = semver::Version::parse(trimmed) {
        return Some(version);
    }

    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.is_empty() || parts.len() > 4 {
        return None;
    }
    let mut numbers = [0u64; 3];
    for (i, part) in parts.iter().enumerate() {
        let n: u64 = part.parse().ok()?;
        if i < 3 {
            numbers[i] = n;
        }
    }
    Some(semver::Version::new(numbers[0], numbers[1], numbers[2]))
}

fn parse_version_field(
    field: &'static str,
    value: Option<&str>,
    warnings: &mut Vec<ManifestWarning>,
) -> semver::Version {
    let Some(text) = value.filter(|v| !v.trim().is_empty()) else {
        return semver::Version::new(1, 0, 0);
    };
    match parse_version_lenient(text) {
        Some(version) => version,
        None => {
            tracing::warn!(field, version = %text, "Invalid manifest version, falling back to 1.0.0");
            warnings.push(ManifestWarning::InvalidVersion {
                field,
                value: text.to_string(),
            });
            semver::Version::new(1, 0, 0)
        }
    }
}

/// Parse a vendor/product id given as `0x` hex string, decimal string or number.
pub fn parse_hardware_id(field: &'static str, value: &Value) -> Result<u16, ManifestError> {
    let invalid = || ManifestError::InvalidHardwareId {
        field,
        value: value.to_string(),
    };
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()).ok_or_else(invalid),
        Value::String(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u16::from_str_radix(hex, 16),
                None => s.parse::<u16>(),
            };
            parsed.map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Lowercase every object key, leaving parameter default values untouched.
fn fold_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut folded = Map::with_capacity(map.len());
            for (key, value) in map {
                let key = key.to_lowercase();
                let value = if key == "default" { value } else { fold_keys(value) };
                folded.insert(key, value);
            }
            Value::Object(folded)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(fold_keys).collect()),
        other => other,
    }
}

// =============================================================================
// Wire model (keys already folded to lowercase)
// =============================================================================

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawManifest {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    version: Option<String>,
    author: Option<String>,
    description: Option<String>,
    #[serde(rename = "minimumsdkversion")]
    minimum_sdk_version: Option<String>,
    #[serde(rename = "assemblyname")]
    assembly_name: Option<String>,
    dependencies: Vec<String>,
    #[serde(rename = "paneltypes")]
    panel_types: Vec<RawPanelType>,
    devices: Vec<RawDevice>,
    protocols: Vec<RawProtocol>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDevice {
    #[serde(rename = "vendorid")]
    vendor_id: Option<Value>,
    #[serde(rename = "productid")]
    product_id: Option<Value>,
    #[serde(rename = "displayname")]
    display_name: Option<String>,
    #[serde(rename = "protocolid")]
    protocol_id: Option<String>,
    width: u32,
    height: u32,
}

impl RawDevice {
    fn into_capability(self) -> Result<DeviceCapability, ManifestError> {
        let vendor_id = self
            .vendor_id
            .ok_or(ManifestError::MissingField("devices.vendorId"))
            .and_then(|v| parse_hardware_id("vendorId", &v))?;
        let product_id = self
            .product_id
            .ok_or(ManifestError::MissingField("devices.productId"))
            .and_then(|v| parse_hardware_id("productId", &v))?;
        let protocol_id = non_empty(self.protocol_id).ok_or(ManifestError::EmptyCapabilityKey("devices"))?;
        Ok(DeviceCapability {
            vendor_id,
            product_id,
            display_name: self.display_name.unwrap_or_default(),
            protocol_id,
            width: self.width,
            height: self.height,
        })
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawProtocol {
    #[serde(rename = "protocolid")]
    protocol_id: Option<String>,
    #[serde(rename = "displayname")]
    display_name: Option<String>,
    #[serde(rename = "defaultport")]
    default_port: u16,
    width: u32,
    height: u32,
    #[serde(rename = "maxpacketsize")]
    max_packet_size: u32,
    #[serde(rename = "maxframerate")]
    max_frame_rate: u32,
    #[serde(rename = "supportsbrightness")]
    supports_brightness: bool,
    #[serde(rename = "supportsorientation")]
    supports_orientation: bool,
}

impl RawProtocol {
    fn into_capability(self) -> Result<ProtocolCapability, ManifestError> {
        let protocol_id = non_empty(self.protocol_id).ok_or(ManifestError::EmptyCapabilityKey("protocols"))?;
        Ok(ProtocolCapability {
            display_name: self.display_name.unwrap_or_else(|| protocol_id.clone()),
            protocol_id,
            default_port: self.default_port,
            width: self.width,
            height: self.height,
            max_packet_size: self.max_packet_size,
            max_frame_rate: self.max_frame_rate,
            supports_brightness: self.supports_brightness,
            supports_orientation: self.supports_orientation,
        })
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawPanelType {
    #[serde(rename = "typeid")]
    type_id: Option<String>,
    #[serde(rename = "displayname")]
    display_name: Option<String>,
    #[serde(rename = "prefixpattern")]
    prefix_pattern: Option<String>,
    category: Option<String>,
    #[serde(rename = "islive")]
    is_live: bool,
    #[serde(rename = "isanimated")]
    is_animated: bool,
    description: Option<String>,
    parameters: Vec<RawParameter>,
}

impl RawPanelType {
    fn into_capability(self) -> Result<PanelTypeCapability, ManifestError> {
        let type_id = non_empty(self.type_id).ok_or(ManifestError::EmptyCapabilityKey("panelTypes"))?;
        Ok(PanelTypeCapability {
            display_name: self.display_name.unwrap_or_else(|| type_id.clone()),
            type_id,
            prefix_pattern: non_empty(self.prefix_pattern),
            category: self.category.unwrap_or_default(),
            is_live: self.is_live,
            is_animated: self.is_animated,
            description: self.description.unwrap_or_default(),
            parameters: self
                .parameters
                .into_iter()
                .filter_map(|p| {
                    let name = non_empty(p.name)?;
                    Some(PanelParameter {
                        name,
                        kind: p.kind.unwrap_or_else(|| "string".to_string()),
                        description: p.description.unwrap_or_default(),
                        required: p.required,
                        default: p.default,
                    })
                })
                .collect(),
        })
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawParameter {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    description: Option<String>,
    required: bool,
    default: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_MANIFEST: &str = r#"{
        "Id": "acme.device",
        "Type": "Device",
        "Name": "ACME LCD",
        "Version": "2.1.0",
        "Author": "ACME",
        "MinimumSdkVersion": "1.0.0",
        "AssemblyName": "libacme_device.so",
        "Devices": [
            { "VendorId": "0x0416", "ProductId": "21250", "DisplayName": "ACME 3.5", "ProtocolId": "acme-proto", "Width": 320, "Height": 480 }
        ],
        "Protocols": [
            { "ProtocolId": "acme-proto", "DefaultPort": 5302, "SupportsBrightness": true }
        ],
        "SomethingElse": { "ignored": true }
    }"#;

    #[test]
    fn test_parse_device_manifest_case_insensitive() {
        let (manifest, warnings) = PluginManifest::parse_with_warnings(DEVICE_MANIFEST.as_bytes()).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(manifest.id, "acme.device");
        assert_eq!(manifest.kind, PluginKind::Device);
        assert_eq!(manifest.version, semver::Version::new(2, 1, 0));
        assert_eq!(manifest.entry_module, "libacme_device.so");

        let device = &manifest.devices()[0];
        assert_eq!(device.vendor_id, 0x0416);
        assert_eq!(device.product_id, 0x5302);
        assert_eq!(device.protocol_id, "acme-proto");

        let protocol = &manifest.protocols()[0];
        assert_eq!(protocol.default_port, 5302);
        assert!(protocol.supports_brightness);
        assert_eq!(protocol.display_name, "acme-proto");
        assert_eq!(manifest.capability_count(), 2);
    }

    #[test]
    fn test_parse_panel_manifest() {
        let json = r#"{
            "id": "com.example.media",
            "type": "panel",
            "assemblyName": "libmedia.so",
            "panelTypes": [
                {
                    "typeId": "video",
                    "prefixPattern": "video:",
                    "isAnimated": true,
                    "parameters": [ { "name": "Loop", "type": "bool", "default": { "Keep": "Case" } } ]
                }
            ]
        }"#;
        let manifest = PluginManifest::parse(json.as_bytes()).unwrap();
        assert_eq!(manifest.kind, PluginKind::Panel);
        assert_eq!(manifest.name, "com.example.media");
        let panel = &manifest.panel_types()[0];
        assert_eq!(panel.prefix_pattern.as_deref(), Some("video:"));
        assert!(panel.is_animated);
        assert_eq!(panel.parameters[0].name, "Loop");
        assert_eq!(panel.parameters[0].default, Some(serde_json::json!({ "Keep": "Case" })));
        assert!(manifest.devices().is_empty());
    }

    #[test]
    fn test_missing_required_fields() {
        let no_id = r#"{ "type": "panel", "assemblyName": "x.so" }"#;
        assert_eq!(
            PluginManifest::parse(no_id.as_bytes()),
            Err(ManifestError::MissingField("id"))
        );

        let empty_entry = r#"{ "id": "a.b", "type": "panel", "assemblyName": "  " }"#;
        assert_eq!(
            PluginManifest::parse(empty_entry.as_bytes()),
            Err(ManifestError::MissingField("assemblyName"))
        );
    }

    #[test]
    fn test_unrecognized_kind_defaults_to_panel() {
        let json = r#"{ "id": "a.b", "type": "devcie", "assemblyName": "x.so" }"#;
        let (manifest, warnings) = PluginManifest::parse_with_warnings(json.as_bytes()).unwrap();
        assert_eq!(manifest.kind, PluginKind::Panel);
        assert_eq!(warnings, vec![ManifestWarning::UnrecognizedKind("devcie".to_string())]);
    }

    #[test]
    fn test_invalid_version_falls_back() {
        let json = r#"{ "id": "a.b", "type": "panel", "version": "banana", "assemblyName": "x.so" }"#;
        let (manifest, warnings) = PluginManifest::parse_with_warnings(json.as_bytes()).unwrap();
        assert_eq!(manifest.version, semver::Version::new(1, 0, 0));
        assert!(matches!(warnings[0], ManifestWarning::InvalidVersion { field: "version", .. }));
    }

    #[test]
    fn test_lenient_versions() {
        assert_eq!(parse_version_lenient("1.2.3"), Some(semver::Version::new(1, 2, 3)));
        assert_eq!(parse_version_lenient("1.2"), Some(semver::Version::new(1, 2, 0)));
        assert_eq!(parse_version_lenient("3"), Some(semver::Version::new(3, 0, 0)));
        assert_eq!(parse_version_lenient("1.2.3.4"), Some(semver::Version::new(1, 2, 3)));
        assert_eq!(parse_version_lenient("v2.0.0"), Some(semver::Version::new(2, 0, 0)));
        assert_eq!(parse_version_lenient("1.x"), None);
    }

    #[test]
    fn test_version_satisfies_is_triple_compare() {
        let current = semver::Version::new(1, 4, 0);
        assert!(version_satisfies(&semver::Version::new(1, 4, 0), &current));
        assert!(version_satisfies(&semver::Version::new(1, 3, 9), &current));
        assert!(!version_satisfies(&semver::Version::new(1, 10, 0), &current));
        assert!(version_satisfies(&semver::Version::parse("1.4.0-beta").unwrap(), &current));
    }

    #[test]
    fn test_hardware_id_forms() {
        assert_eq!(parse_hardware_id("vendorId", &Value::from("0x0416")), Ok(0x0416));
        assert_eq!(parse_hardware_id("vendorId", &Value::from("0X1a86")), Ok(0x1a86));
        assert_eq!(parse_hardware_id("vendorId", &Value::from("1046")), Ok(1046));
        assert_eq!(parse_hardware_id("vendorId", &Value::from(1046)), Ok(1046));
        assert!(parse_hardware_id("vendorId", &Value::from("0xZZZZ")).is_err());
        assert!(parse_hardware_id("vendorId", &Value::from(70000)).is_err());
        assert!(parse_hardware_id("vendorId", &Value::Bool(true)).is_err());
    }

    #[test]
    fn test_empty_capability_key_rejected() {
        let json = r#"{ "id": "a.b", "type": "device", "assemblyName": "x.so", "protocols": [ { "protocolId": "" } ] }"#;
        assert_eq!(
            PluginManifest::parse(json.as_bytes()),
            Err(ManifestError::EmptyCapabilityKey("protocols"))
        );
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(PluginManifest::parse(b"{ not json"), Err(ManifestError::Json(_))));
        assert!(matches!(PluginManifest::parse(b"[1, 2]"), Err(ManifestError::Json(_))));
    }
}
