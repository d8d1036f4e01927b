pub mod config;
pub mod plugin;

// Re-export commonly used items for convenience
pub use config::{ConfigError, HostConfig};
pub use plugin::{DeviceRuntime, PanelRuntime, PluginRuntime};

/// Contract crate shared with plugins.
pub use lcd_plugin_api as api;
