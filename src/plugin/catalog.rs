//! Plugin Catalog
//!
//! Scans search directories for `plugin.json` manifests, validates them and
//! builds the routing table from the entries that survive. No module is loaded here.
//!
//! Directories are scanned in priority order and insertion always
//! overwrites, so a user-installed plugin replaces a built-in one with the
//! same id. Every collision and every skipped plugin is reported as a
//! [`Diagnostic`]; none of them is fatal.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lcd_plugin_api::PluginKind;

use super::lifecycle::PluginSlot;
use super::loader::ModuleLoader;
use super::manifest::{MANIFEST_FILE, ManifestWarning, PluginManifest, version_satisfies};
use super::routing::{RouteOverride, RoutingTable, RoutingTableBuilder};
use super::search_paths::{PluginOrigin, SearchPath};

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    /// Advisory; the plugin is still cataloged
    Warning,
    /// The plugin was left out of the catalog
    Skipped,
}

impl fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSeverity::Warning => write!(f, "warning"),
            DiagnosticSeverity::Skipped => write!(f, "skipped"),
        }
    }
}

/// What a diagnostic is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Same id seen again; the later directory wins
    DuplicateId { previous_dir: PathBuf },
    /// A capability key changed owner
    CapabilityOverride(RouteOverride),
    /// Manifest `type` not recognized, cataloged as panel
    UnrecognizedKind,
    /// Manifest version unparsable, treated as 1.0.0
    InvalidVersion,
    /// Manifest unreadable or invalid
    ManifestInvalid,
    /// Entry module file does not exist
    EntryModuleMissing { path: PathBuf },
    /// Plugin needs a newer runtime
    VersionIncompatible {
        required: semver::Version,
        current: semver::Version,
    },
    /// A plugin directory could not be listed
    ScanError,
}

impl DiagnosticKind {
    pub fn severity(&self) -> DiagnosticSeverity {
        match self {
            DiagnosticKind::DuplicateId { .. }
            | DiagnosticKind::CapabilityOverride(_)
            | DiagnosticKind::UnrecognizedKind
            | DiagnosticKind::InvalidVersion
            | DiagnosticKind::ScanError => DiagnosticSeverity::Warning,
            DiagnosticKind::ManifestInvalid
            | DiagnosticKind::EntryModuleMissing { .. }
            | DiagnosticKind::VersionIncompatible { .. } => DiagnosticSeverity::Skipped,
        }
    }
}

/// A discovery-time observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Plugin id, when the manifest got far enough to have one
    pub plugin_id: Option<String>,
    /// Directory the diagnostic refers to
    pub dir: PathBuf,
    pub message: String,
}

impl Diagnostic {
    pub fn severity(&self) -> DiagnosticSeverity {
        self.kind.severity()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.severity())?;
        if let Some(id) = &self.plugin_id {
            write!(f, "{id}: ")?;
        }
        write!(f, "{} ({})", self.message, self.dir.display())
    }
}

/// A cataloged plugin.
#[derive(Debug)]
pub struct CatalogEntry {
    manifest: PluginManifest,
    dir: PathBuf,
    entry_path: PathBuf,
    origin: PluginOrigin,
    slot: Arc<PluginSlot>,
}

impl CatalogEntry {
    pub fn new(manifest: PluginManifest, dir: PathBuf, origin: PluginOrigin) -> Self {
        let entry_path = dir.join(&manifest.entry_module);
        let slot = Arc::new(PluginSlot::new(manifest.id.clone()));
        Self {
            manifest,
            dir,
            entry_path,
            origin,
            slot,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Absolute plugin directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute entry module path.
    pub fn entry_path(&self) -> &Path {
        &self.entry_path
    }

    pub fn origin(&self) -> PluginOrigin {
        self.origin
    }

    /// Attachment point for the live plugin.
    pub fn slot(&self) -> &Arc<PluginSlot> {
        &self.slot
    }

    /// Reuse the slot of a previous catalog's entry for the same id.
    pub(crate) fn adopt_slot(&mut self, slot: Arc<PluginSlot>) {
        self.slot = slot;
    }
}

/// Plugins of one kind, keyed by lowercased id.
#[derive(Debug)]
pub struct Catalog {
    kind: PluginKind,
    entries: HashMap<String, Arc<CatalogEntry>>,
}

/// Result of a scan.
#[derive(Debug)]
pub struct ScanOutcome {
    pub catalog: Catalog,
    pub routes: RoutingTable,
    pub diagnostics: Vec<Diagnostic>,
}

impl Catalog {
    pub fn empty(kind: PluginKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Entry for an id, case-insensitively.
    pub fn get(&self, id: &str) -> Option<&Arc<CatalogEntry>> {
        self.entries.get(&id.to_lowercase())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Entries sorted by id.
    pub fn entries(&self) -> Vec<Arc<CatalogEntry>> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.manifest().key());
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Carry live slots over from a previous catalog.
    ///
    /// Returns the slots of ids that are no longer cataloged.
    pub(crate) fn adopt_slots(&mut self, previous: &Catalog) -> Vec<Arc<PluginSlot>> {
        let mut orphaned = Vec::new();
        for (key, old) in &previous.entries {
            match self.entries.get_mut(key) {
                Some(entry) => match Arc::get_mut(entry) {
                    Some(entry) => entry.adopt_slot(old.slot().clone()),
                    None => orphaned.push(old.slot().clone()),
                },
                None => orphaned.push(old.slot().clone()),
            }
        }
        orphaned
    }

    /// Scan `search_paths` in order for plugins of `kind`.
    pub fn scan(
        kind: PluginKind,
        search_paths: &[SearchPath],
        runtime_version: &semver::Version,
        loader: &dyn ModuleLoader,
    ) -> ScanOutcome {
        let mut scanner = Scanner {
            kind,
            runtime_version,
            loader,
            entries: HashMap::new(),
            order: Vec::new(),
            routes: RoutingTableBuilder::new(),
            diagnostics: Vec::new(),
        };

        for search_path in search_paths {
            scanner.scan_dir(search_path);
        }
        scanner.register_routes();

        let Scanner {
            entries,
            routes,
            diagnostics,
            ..
        } = scanner;
        let routes = routes.build();
        debug_assert!(routes.owners().all(|id| entries.contains_key(&id.to_lowercase())));

        tracing::info!(
            kind = %kind,
            plugins = entries.len(),
            routes = routes.len(),
            diagnostics = diagnostics.len(),
            "Plugin discovery completed"
        );

        ScanOutcome {
            catalog: Catalog { kind, entries },
            routes,
            diagnostics,
        }
    }
}

struct Scanner<'a> {
    kind: PluginKind,
    runtime_version: &'a semver::Version,
    loader: &'a dyn ModuleLoader,
    entries: HashMap<String, Arc<CatalogEntry>>,
    /// Keys in the order their winning manifest was scanned
    order: Vec<String>,
    routes: RoutingTableBuilder,
    diagnostics: Vec<Diagnostic>,
}

impl Scanner<'_> {
    fn scan_dir(&mut self, search_path: &SearchPath) {
        let root = &search_path.dir;
        if !root.is_dir() {
            tracing::debug!(path = %root.display(), "Plugin directory does not exist");
            return;
        }

        let listing = match std::fs::read_dir(root) {
            Ok(listing) => listing,
            Err(e) => {
                self.report(DiagnosticKind::ScanError, None, root, format!("cannot list directory: {e}"));
                return;
            }
        };

        let mut subdirs: Vec<PathBuf> = listing
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        subdirs.sort();

        for dir in subdirs {
            let dir = std::path::absolute(&dir).unwrap_or(dir);
            self.scan_plugin_dir(&dir, search_path.origin);
        }
    }

    fn scan_plugin_dir(&mut self, dir: &Path, origin: PluginOrigin) {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            tracing::trace!(path = %dir.display(), "No manifest, skipping directory");
            return;
        }

        let bytes = match std::fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report(DiagnosticKind::ManifestInvalid, None, dir, format!("cannot read manifest: {e}"));
                return;
            }
        };

        let (manifest, warnings) = match PluginManifest::parse_with_warnings(&bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.report(DiagnosticKind::ManifestInvalid, None, dir, e.to_string());
                return;
            }
        };

        if manifest.kind != self.kind {
            tracing::debug!(
                plugin_id = %manifest.id,
                kind = %manifest.kind,
                "Plugin belongs to the other runtime, skipping"
            );
            return;
        }

        for warning in warnings {
            let kind = match warning {
                ManifestWarning::UnrecognizedKind(_) => DiagnosticKind::UnrecognizedKind,
                ManifestWarning::InvalidVersion { .. } => DiagnosticKind::InvalidVersion,
            };
            self.report(kind, Some(&manifest.id), dir, warning.to_string());
        }

        let entry_path = dir.join(&manifest.entry_module);
        if !self.loader.exists(&entry_path) {
            self.report(
                DiagnosticKind::EntryModuleMissing {
                    path: entry_path.clone(),
                },
                Some(&manifest.id),
                dir,
                format!("entry module {} not found", entry_path.display()),
            );
            return;
        }

        if !version_satisfies(&manifest.minimum_runtime_version, self.runtime_version) {
            self.report(
                DiagnosticKind::VersionIncompatible {
                    required: manifest.minimum_runtime_version.clone(),
                    current: self.runtime_version.clone(),
                },
                Some(&manifest.id),
                dir,
                format!(
                    "requires runtime {}, running {}",
                    manifest.minimum_runtime_version, self.runtime_version
                ),
            );
            return;
        }

        let key = manifest.key();
        if let Some(previous) = self.entries.get(&key) {
            let previous_dir = previous.dir().to_path_buf();
            let message = format!("duplicate id, overriding plugin from {}", previous_dir.display());
            self.report(DiagnosticKind::DuplicateId { previous_dir }, Some(&manifest.id), dir, message);
            self.order.retain(|k| *k != key);
        }

        tracing::debug!(
            plugin_id = %manifest.id,
            origin = %origin,
            capabilities = manifest.capability_count(),
            "Plugin cataloged"
        );
        self.order.push(key.clone());
        self.entries
            .insert(key, Arc::new(CatalogEntry::new(manifest, dir.to_path_buf(), origin)));
    }

    /// Route the capabilities of the surviving entries, in scan order.
    ///
    /// Entries replaced by a later manifest with the same id contribute no routes.
    fn register_routes(&mut self) {
        let order = std::mem::take(&mut self.order);
        for key in &order {
            if let Some(entry) = self.entries.get(key).cloned() {
                self.register_capabilities(entry.manifest(), entry.dir());
            }
        }
    }

    fn register_capabilities(&mut self, manifest: &PluginManifest, dir: &Path) {
        let id = manifest.id.as_str();
        let mut overrides = Vec::new();
        for device in manifest.devices() {
            overrides.extend(self.routes.register_hardware(device.vendor_id, device.product_id, id));
        }
        for protocol in manifest.protocols() {
            overrides.extend(self.routes.register_protocol(&protocol.protocol_id, id));
        }
        for panel in manifest.panel_types() {
            overrides.extend(self.routes.register_panel_type(&panel.type_id, &panel.type_id, id));
            if let Some(prefix) = &panel.prefix_pattern {
                overrides.extend(self.routes.register_panel_prefix(prefix, &panel.type_id, id));
            }
        }
        for record in overrides {
            let message = format!("{} now served by {} instead of {}", record.key, record.replacement, record.previous);
            self.report(DiagnosticKind::CapabilityOverride(record), Some(id), dir, message);
        }
    }

    fn report(&mut self, kind: DiagnosticKind, plugin_id: Option<&str>, dir: &Path, message: String) {
        let diagnostic = Diagnostic {
            kind,
            plugin_id: plugin_id.map(str::to_string),
            dir: dir.to_path_buf(),
            message,
        };
        match diagnostic.severity() {
            DiagnosticSeverity::Warning => tracing::warn!(
                plugin_id = ?diagnostic.plugin_id,
                path = %dir.display(),
                "{}",
                diagnostic.message
            ),
            DiagnosticSeverity::Skipped => tracing::warn!(
                plugin_id = ?diagnostic.plugin_id,
                path = %dir.display(),
                "Skipping plugin: {}",
                diagnostic.message
            ),
        }
        self.diagnostics.push(diagnostic);
    }
}
