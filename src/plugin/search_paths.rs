//! Platform search paths for plugin directories.

use std::fmt;
use std::path::{Path, PathBuf};

/// Application directory name under the user data directory.
pub const APP_DIR_NAME: &str = "lcd-host";

/// Plugin subdirectory name.
pub const PLUGINS_DIR_NAME: &str = "plugins";

/// Where a plugin directory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginOrigin {
    /// Shipped beside the host binary
    BuiltIn,
    /// Installed by the user
    User,
}

impl fmt::Display for PluginOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginOrigin::BuiltIn => write!(f, "builtin"),
            PluginOrigin::User => write!(f, "user"),
        }
    }
}

/// A directory scanned for plugin subdirectories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    pub dir: PathBuf,
    pub origin: PluginOrigin,
}

impl SearchPath {
    pub fn builtin(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            origin: PluginOrigin::BuiltIn,
        }
    }

    pub fn user(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            origin: PluginOrigin::User,
        }
    }
}

/// `plugins` beside the running executable.
pub fn default_builtin_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(PLUGINS_DIR_NAME)))
}

/// `<user data dir>/lcd-host/plugins`.
pub fn default_user_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(APP_DIR_NAME).join(PLUGINS_DIR_NAME))
}

/// Search paths in priority order: built-in first, then user, then extras.
///
/// Later entries override earlier ones for the same plugin id.
pub fn resolve_search_paths(
    builtin_dir: Option<&Path>,
    user_dir: Option<&Path>,
    extra_dirs: &[PathBuf],
) -> Vec<SearchPath> {
    let mut paths = Vec::new();
    if let Some(dir) = builtin_dir.map(Path::to_path_buf).or_else(default_builtin_dir) {
        paths.push(SearchPath::builtin(dir));
    }
    if let Some(dir) = user_dir.map(Path::to_path_buf).or_else(default_user_dir) {
        paths.push(SearchPath::user(dir));
    }
    paths.extend(extra_dirs.iter().cloned().map(SearchPath::user));
    paths
}
