use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use super::ConfigError;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values set here
/// override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// plugins:
///   builtin_dir: "/opt/lcd-host/plugins"
///   user_dir: "/home/me/.local/share/lcd-host/plugins"
///   extra_dirs:
///     - "/srv/lcd/plugins"
///   shared_modules:
///     - "lcd_telemetry_api"
///   init_timeout_ms: 5000
///   settings:
///     com.example.clock:
///       format: "24h"
///
/// runtime:
///   version: "1.2.0"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub plugins: Option<PluginsYaml>,
    pub runtime: Option<RuntimeYaml>,
}

/// Plugin discovery and loading from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PluginsYaml {
    /// Replaces the directory beside the host binary
    pub builtin_dir: Option<String>,
    /// Replaces the per-user data directory
    pub user_dir: Option<String>,
    /// Scanned after the user directory, in order
    pub extra_dirs: Option<Vec<String>>,
    /// Contract modules shared with plugins, in addition to the defaults
    pub shared_modules: Option<Vec<String>>,
    pub init_timeout_ms: Option<u64>,
    /// Settings documents keyed by plugin id
    pub settings: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeYaml {
    /// Overrides the SDK version reported to plugins
    pub version: Option<String>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&contents)
    }

    /// Parse YAML text. An empty document yields the defaults.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
