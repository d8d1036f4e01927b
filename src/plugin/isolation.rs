//! Plugin call isolation
//!
//! Every call into plugin code from the runtime facade goes through these
//! helpers. A plugin error comes back as an FFI `RResult`; a panic on the
//! host side of the call (a closure building arguments, a wrapper decoding
//! results) is caught with `catch_unwind`. Both become a [`PluginError`],
//! which the facade logs with the plugin id and turns into "no result".
//!
//! # Safety Considerations
//!
//! - `catch_unwind` only catches panics, not aborts
//! - A panic that unwinds out of an `extern "C"` plugin function aborts the
//!   process; plugins must catch their own panics and report an `RErr`

use std::any::Any;
use std::panic::{UnwindSafe, catch_unwind};

use lcd_plugin_api::{RResult, RString};

/// Failure of a single call into a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// Plugin panicked during execution
    #[error("Plugin panicked: {0}")]
    Panic(String),

    /// Plugin reported an error
    #[error("Plugin call failed: {0}")]
    CallFailed(String),

    /// Plugin does not provide the requested operation
    #[error("Plugin does not support {0}")]
    Unsupported(String),

    /// No plugin owns the requested capability
    #[error("No plugin registered for {0}")]
    NoOwner(String),
}

/// Convert an FFI result into a `Result`.
pub fn from_ffi<T>(result: RResult<T, RString>) -> Result<T, PluginError> {
    result.into_result().map_err(|e| PluginError::CallFailed(e.into_string()))
}

/// Safely call a plugin function with panic catching
///
/// If the closure panics, the panic is converted to `PluginError::Panic`.
///
/// # Example
///
/// ```ignore
/// let driver = call_plugin_safely(|| from_ffi(create(handle, &descriptor, opener)))?;
/// ```
pub fn call_plugin_safely<F, T>(plugin_fn: F) -> Result<T, PluginError>
where
    F: FnOnce() -> Result<T, PluginError> + UnwindSafe,
{
    match catch_unwind(plugin_fn) {
        Ok(result) => result,
        Err(panic_info) => {
            let msg = extract_panic_message(&panic_info);
            tracing::error!(message = %msg, "Plugin panicked");
            Err(PluginError::Panic(msg))
        }
    }
}

/// Safely call a plugin function that returns a value directly (no Result)
pub fn call_plugin_safely_value<F, T>(plugin_fn: F) -> Result<T, PluginError>
where
    F: FnOnce() -> T + UnwindSafe,
{
    match catch_unwind(plugin_fn) {
        Ok(result) => Ok(result),
        Err(panic_info) => {
            let msg = extract_panic_message(&panic_info);
            tracing::error!(message = %msg, "Plugin panicked");
            Err(PluginError::Panic(msg))
        }
    }
}

/// Extract a human-readable message from panic info
pub(crate) fn extract_panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (non-string payload)".to_string()
    }
}
