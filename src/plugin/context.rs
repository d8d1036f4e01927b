//! Host services exposed to plugins
//!
//! A plugin reaches the host only through the [`PluginContext`] it receives
//! in `initialize`. The context carries two callbacks, logging and service
//! resolution, whose `user_data` points at the plugin's own [`HostContext`].
//! Nothing in it addresses other plugins.

use std::marker::PhantomData;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use lcd_plugin_api::{
    HostCallbacks, LogCallbackFn, LogLevel, PluginContext, ROption, RString, ResolveServiceFn,
    SETTINGS_SERVICE, SemVer,
};

/// Service name returning the negotiated runtime version.
pub const RUNTIME_VERSION_SERVICE: &str = "runtime.version";

/// Service name returning the plugin's own directory.
pub const PLUGIN_DIR_SERVICE: &str = "plugin.dir";

/// Host-wide service values shared by every plugin context.
///
/// Settings are stored per plugin id and only served to that plugin.
#[derive(Debug, Default)]
pub struct HostServices {
    settings: DashMap<String, serde_json::Value>,
    services: DashMap<String, String>,
}

impl HostServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the settings document for a plugin id.
    pub fn set_plugin_settings(&self, plugin_id: &str, settings: serde_json::Value) {
        self.settings.insert(plugin_id.to_lowercase(), settings);
    }

    /// Settings document for a plugin id.
    pub fn plugin_settings(&self, plugin_id: &str) -> Option<serde_json::Value> {
        self.settings.get(&plugin_id.to_lowercase()).map(|v| v.clone())
    }

    /// Register a named host service value visible to every plugin.
    pub fn register(&self, name: impl Into<String>, value: impl Into<String>) {
        self.services.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.services.get(name).map(|v| v.clone())
    }
}

/// Per-plugin host state behind the FFI callbacks.
#[derive(Debug)]
pub struct HostContext {
    plugin_id: String,
    plugin_dir: PathBuf,
    runtime_version: semver::Version,
    services: Arc<HostServices>,
}

impl HostContext {
    pub fn new(
        plugin_id: impl Into<String>,
        plugin_dir: impl Into<PathBuf>,
        runtime_version: semver::Version,
        services: Arc<HostServices>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin_dir: plugin_dir.into(),
            runtime_version,
            services,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Resolve a service for this plugin.
    pub fn resolve(&self, name: &str) -> Option<String> {
        match name {
            SETTINGS_SERVICE => self
                .services
                .plugin_settings(&self.plugin_id)
                .map(|settings| settings.to_string()),
            RUNTIME_VERSION_SERVICE => Some(self.runtime_version.to_string()),
            PLUGIN_DIR_SERVICE => Some(self.plugin_dir.display().to_string()),
            other => self.services.get(other),
        }
    }

    /// Build the FFI context handed to `initialize`.
    ///
    /// The callbacks point at `self`, so the returned context borrows it.
    /// A plugin may copy the callbacks past this borrow; the owner keeps the
    /// `HostContext` alive until the instance is dropped.
    pub fn ffi_context(&self) -> FfiContext<'_> {
        FfiContext {
            context: PluginContext {
                plugin_id: RString::from(self.plugin_id.as_str()),
                plugin_dir: RString::from(self.plugin_dir.to_string_lossy().into_owned()),
                runtime_version: to_sem_ver(&self.runtime_version),
                host: HostCallbacks {
                    user_data: self as *const HostContext as *const (),
                    log: LogCallbackFn { func: host_log },
                    resolve_service: ResolveServiceFn {
                        func: host_resolve_service,
                    },
                },
            },
            _host: PhantomData,
        }
    }
}

/// A [`PluginContext`] tied to the [`HostContext`] its callbacks point at.
pub struct FfiContext<'a> {
    context: PluginContext,
    _host: PhantomData<&'a HostContext>,
}

impl FfiContext<'_> {
    pub fn as_ffi(&self) -> &PluginContext {
        &self.context
    }
}

impl Deref for FfiContext<'_> {
    type Target = PluginContext;

    fn deref(&self) -> &PluginContext {
        &self.context
    }
}

/// Convert a semver version to the FFI triple, saturating oversized parts.
pub fn to_sem_ver(version: &semver::Version) -> SemVer {
    let part = |n: u64| u32::try_from(n).unwrap_or(u32::MAX);
    SemVer::new(part(version.major), part(version.minor), part(version.patch))
}

extern "C" fn host_log(user_data: *const (), level: LogLevel, message: *const RString) {
    // SAFETY: user_data is the HostContext the plugin was initialized with,
    // kept alive by the LoadedPlugin until the instance is dropped.
    let Some(context) = (unsafe { (user_data as *const HostContext).as_ref() }) else {
        return;
    };
    let Some(message) = (unsafe { message.as_ref() }) else {
        return;
    };
    let plugin_id = context.plugin_id.as_str();
    match level {
        LogLevel::Trace => tracing::trace!(plugin_id, "{}", message),
        LogLevel::Debug => tracing::debug!(plugin_id, "{}", message),
        LogLevel::Info => tracing::info!(plugin_id, "{}", message),
        LogLevel::Warn => tracing::warn!(plugin_id, "{}", message),
        LogLevel::Error => tracing::error!(plugin_id, "{}", message),
    }
}

extern "C" fn host_resolve_service(user_data: *const (), name: *const RString) -> ROption<RString> {
    // SAFETY: see host_log.
    let Some(context) = (unsafe { (user_data as *const HostContext).as_ref() }) else {
        return ROption::RNone;
    };
    let Some(name) = (unsafe { name.as_ref() }) else {
        return ROption::RNone;
    };
    match context.resolve(name.as_str()) {
        Some(value) => ROption::RSome(RString::from(value)),
        None => ROption::RNone,
    }
}
