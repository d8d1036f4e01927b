//! Configuration module for the LCD host
//!
//! Configuration comes from .env files, environment variables and an optional
//! YAML file. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//!
//! # Example
//! ```rust,no_run
//! use lcd_host::config::HostConfig;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = HostConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config = HostConfig::from_file(Path::new("lcd-host.yaml"))?;
//!
//! for path in config.search_paths() {
//!     println!("{} ({})", path.dir.display(), path.origin);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod yaml;

pub use yaml::{PluginsYaml, RuntimeYaml, YamlConfig};

use crate::plugin::boundary::SharedModules;
use crate::plugin::context::HostServices;
use crate::plugin::loader::ModuleLoader;
use crate::plugin::runtime::{PluginRuntime, RuntimeKind, sdk_version};
use crate::plugin::search_paths::{SearchPath, resolve_search_paths};

pub const ENV_BUILTIN_DIR: &str = "LCD_PLUGIN_BUILTIN_DIR";
pub const ENV_USER_DIR: &str = "LCD_PLUGIN_USER_DIR";
pub const ENV_EXTRA_DIRS: &str = "LCD_PLUGIN_EXTRA_DIRS";
pub const ENV_INIT_TIMEOUT_MS: &str = "LCD_PLUGIN_INIT_TIMEOUT_MS";

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse YAML config: {0}")]
    Parse(String),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Plugin init timeout must be greater than zero")]
    ZeroInitTimeout,

    #[error("Invalid runtime version {0:?}")]
    InvalidRuntimeVersion(String),
}

/// Host configuration
///
/// Controls where plugins are searched for and how they are loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostConfig {
    /// Replaces `<dir of host binary>/plugins`
    pub builtin_dir: Option<PathBuf>,
    /// Replaces `<user data dir>/lcd-host/plugins`
    pub user_dir: Option<PathBuf>,
    /// Additional user directories, scanned last
    pub extra_dirs: Vec<PathBuf>,
    /// Shared contract modules beyond the defaults
    pub shared_modules: Vec<String>,
    /// Upper bound on a plugin load; `None` waits indefinitely
    pub init_timeout: Option<Duration>,
    /// Settings documents keyed by plugin id
    pub plugin_settings: HashMap<String, serde_json::Value>,
    /// Overrides the SDK version
    pub runtime_version: Option<semver::Version>,
}

impl HostConfig {
    /// Load configuration from environment variables
    ///
    /// The .env file is loaded in main.rs at application startup, so its
    /// values are already visible as environment variables here.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = HostConfig::default();

        if let Some(dir) = env_var(ENV_BUILTIN_DIR) {
            config.builtin_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = env_var(ENV_USER_DIR) {
            config.user_dir = Some(PathBuf::from(dir));
        }
        if let Some(dirs) = env_var(ENV_EXTRA_DIRS) {
            config.extra_dirs = std::env::split_paths(&dirs)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        if let Some(value) = env_var(ENV_INIT_TIMEOUT_MS) {
            let ms: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_INIT_TIMEOUT_MS,
                value: value.clone(),
            })?;
            config.init_timeout = Some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an environment
    /// variable is malformed, or validation fails.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = Self::from_env()?;
        config.apply_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) -> Result<(), ConfigError> {
        if let Some(plugins) = yaml.plugins {
            if let Some(dir) = plugins.builtin_dir {
                self.builtin_dir = Some(PathBuf::from(dir));
            }
            if let Some(dir) = plugins.user_dir {
                self.user_dir = Some(PathBuf::from(dir));
            }
            if let Some(dirs) = plugins.extra_dirs {
                self.extra_dirs = dirs.into_iter().map(PathBuf::from).collect();
            }
            if let Some(modules) = plugins.shared_modules {
                self.shared_modules = modules;
            }
            if let Some(ms) = plugins.init_timeout_ms {
                self.init_timeout = Some(Duration::from_millis(ms));
            }
            self.plugin_settings.extend(plugins.settings);
        }
        if let Some(version) = yaml.runtime.and_then(|r| r.version) {
            let parsed = semver::Version::parse(version.trim())
                .map_err(|_| ConfigError::InvalidRuntimeVersion(version.clone()))?;
            self.runtime_version = Some(parsed);
        }
        Ok(())
    }

    /// Check the merged configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.init_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroInitTimeout);
        }
        Ok(())
    }

    /// Search paths in priority order.
    pub fn search_paths(&self) -> Vec<SearchPath> {
        resolve_search_paths(self.builtin_dir.as_deref(), self.user_dir.as_deref(), &self.extra_dirs)
    }

    /// The configured runtime version, or the SDK version.
    pub fn effective_runtime_version(&self) -> semver::Version {
        self.runtime_version.clone().unwrap_or_else(sdk_version)
    }

    /// Host services carrying the configured plugin settings.
    pub fn host_services(&self) -> HostServices {
        let services = HostServices::new();
        for (plugin_id, settings) in &self.plugin_settings {
            services.set_plugin_settings(plugin_id, settings.clone());
        }
        services
    }

    /// Shared module set with the configured extras.
    pub fn shared_modules(&self, loader: Arc<dyn ModuleLoader>) -> SharedModules {
        SharedModules::with_defaults(&self.shared_modules, loader)
    }

    /// Build a runtime from this configuration.
    ///
    /// Pass the same `shared` and `services` to both runtimes of a process.
    pub fn runtime<K: RuntimeKind>(
        &self,
        loader: Arc<dyn ModuleLoader>,
        shared: Arc<SharedModules>,
        services: Arc<HostServices>,
    ) -> PluginRuntime<K> {
        PluginRuntime::<K>::builder()
            .search_paths(self.search_paths())
            .runtime_version(self.effective_runtime_version())
            .loader(loader)
            .shared_modules(shared)
            .services(services)
            .init_timeout(self.init_timeout)
            .build()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::search_paths::PluginOrigin;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    // Helper to clean up environment variables
    fn cleanup_env_vars() {
        unsafe {
            env::remove_var(ENV_BUILTIN_DIR);
            env::remove_var(ENV_USER_DIR);
            env::remove_var(ENV_EXTRA_DIRS);
            env::remove_var(ENV_INIT_TIMEOUT_MS);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = HostConfig::from_env().unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.effective_runtime_version(), sdk_version());

        let paths = config.search_paths();
        assert_eq!(paths[0].origin, PluginOrigin::BuiltIn);
        assert!(paths.iter().skip(1).all(|p| p.origin == PluginOrigin::User));
    }

    #[test]
    #[serial]
    fn test_from_env_values() {
        cleanup_env_vars();
        let extra = env::join_paths(["/srv/a", "/srv/b"]).unwrap();
        unsafe {
            env::set_var(ENV_BUILTIN_DIR, "/opt/lcd/plugins");
            env::set_var(ENV_USER_DIR, "/home/me/plugins");
            env::set_var(ENV_EXTRA_DIRS, &extra);
            env::set_var(ENV_INIT_TIMEOUT_MS, "1500");
        }

        let config = HostConfig::from_env().unwrap();
        assert_eq!(config.builtin_dir, Some(PathBuf::from("/opt/lcd/plugins")));
        assert_eq!(config.user_dir, Some(PathBuf::from("/home/me/plugins")));
        assert_eq!(config.extra_dirs, vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]);
        assert_eq!(config.init_timeout, Some(Duration::from_millis(1500)));

        let paths = config.search_paths();
        assert_eq!(
            paths,
            vec![
                SearchPath::builtin("/opt/lcd/plugins"),
                SearchPath::user("/home/me/plugins"),
                SearchPath::user("/srv/a"),
                SearchPath::user("/srv/b"),
            ]
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_timeout() {
        cleanup_env_vars();
        unsafe {
            env::set_var(ENV_INIT_TIMEOUT_MS, "soon");
        }
        assert!(matches!(
            HostConfig::from_env(),
            Err(ConfigError::InvalidEnv { var: ENV_INIT_TIMEOUT_MS, .. })
        ));

        unsafe {
            env::set_var(ENV_INIT_TIMEOUT_MS, "0");
        }
        assert_eq!(HostConfig::from_env(), Err(ConfigError::ZeroInitTimeout));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            r#"
plugins:
  user_dir: "/yaml/plugins"
  shared_modules: ["lcd_telemetry_api"]
  settings:
    com.example.clock:
      format: "24h"
runtime:
  version: "1.3.0"
"#,
        )
        .unwrap();

        unsafe {
            env::set_var(ENV_USER_DIR, "/env/plugins");
            env::set_var(ENV_BUILTIN_DIR, "/env/builtin");
        }

        let config = HostConfig::from_file(&config_path).unwrap();
        // YAML overrides ENV
        assert_eq!(config.user_dir, Some(PathBuf::from("/yaml/plugins")));
        // ENV value kept where YAML is silent
        assert_eq!(config.builtin_dir, Some(PathBuf::from("/env/builtin")));
        assert_eq!(config.shared_modules, vec!["lcd_telemetry_api"]);
        assert_eq!(config.effective_runtime_version(), semver::Version::new(1, 3, 0));

        let services = config.host_services();
        assert_eq!(
            services.plugin_settings("COM.EXAMPLE.CLOCK"),
            Some(serde_json::json!({ "format": "24h" }))
        );

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_validation() {
        cleanup_env_vars();
        let temp_dir = TempDir::new().unwrap();

        let zero = temp_dir.path().join("zero.yaml");
        fs::write(&zero, "plugins:\n  init_timeout_ms: 0\n").unwrap();
        assert_eq!(HostConfig::from_file(&zero), Err(ConfigError::ZeroInitTimeout));

        let version = temp_dir.path().join("version.yaml");
        fs::write(&version, "runtime:\n  version: \"one\"\n").unwrap();
        assert_eq!(
            HostConfig::from_file(&version),
            Err(ConfigError::InvalidRuntimeVersion("one".into()))
        );
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let result = HostConfig::from_file(Path::new("/nonexistent/config.yaml"));
        assert!(result.unwrap_err().to_string().contains("Failed to read config file"));
    }
}
