//! Capability routing tables
//!
//! Maps capability keys (hardware ids, protocol ids, panel type ids and panel
//! input prefixes) to the id of the plugin that serves them. A table is built
//! once per discovery pass by [`RoutingTableBuilder`] and is read-only
//! afterwards; re-discovery builds a new table instead of patching this one.
//!
//! String keys are case-insensitive. A later registration for the same key
//! always replaces the earlier one.

use std::collections::HashMap;
use std::fmt;

/// A lookup key mapped to an owning plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CapabilityKey {
    /// USB vendor/product pair
    Hardware { vendor_id: u16, product_id: u16 },
    /// Wire protocol id
    Protocol(String),
    /// Panel type id
    PanelType(String),
    /// Panel input prefix such as `video:`
    PanelPrefix(String),
}

impl CapabilityKey {
    pub fn hardware(vendor_id: u16, product_id: u16) -> Self {
        CapabilityKey::Hardware {
            vendor_id,
            product_id,
        }
    }

    pub fn protocol(id: impl Into<String>) -> Self {
        CapabilityKey::Protocol(id.into())
    }

    pub fn panel_type(id: impl Into<String>) -> Self {
        CapabilityKey::PanelType(id.into())
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKey::Hardware {
                vendor_id,
                product_id,
            } => write!(f, "usb:{vendor_id:04x}:{product_id:04x}"),
            CapabilityKey::Protocol(id) => write!(f, "protocol:{id}"),
            CapabilityKey::PanelType(id) => write!(f, "panel:{id}"),
            CapabilityKey::PanelPrefix(prefix) => write!(f, "prefix:{prefix}"),
        }
    }
}

/// Target of a panel-type route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelRoute {
    pub plugin_id: String,
    /// Canonical type id as declared in the manifest
    pub type_id: String,
}

/// A panel input resolved to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPanel {
    pub plugin_id: String,
    pub type_id: String,
    /// Text after the prefix, e.g. `path/to/file.mp4` for `video:path/to/file.mp4`
    pub argument: Option<String>,
}

#[derive(Debug, Clone)]
struct PrefixRoute {
    prefix: String,
    route: PanelRoute,
}

/// A key whose owner changed during a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOverride {
    pub key: CapabilityKey,
    pub previous: String,
    pub replacement: String,
}

/// Read-only capability routes of one runtime.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    hardware: HashMap<(u16, u16), String>,
    protocols: HashMap<String, String>,
    panel_types: HashMap<String, PanelRoute>,
    /// Longest prefix first
    prefixes: Vec<PrefixRoute>,
}

impl RoutingTable {
    /// Owner of a capability key.
    pub fn find(&self, key: &CapabilityKey) -> Option<&str> {
        match key {
            CapabilityKey::Hardware {
                vendor_id,
                product_id,
            } => self.find_hardware(*vendor_id, *product_id),
            CapabilityKey::Protocol(id) => self.find_protocol(id),
            CapabilityKey::PanelType(id) => self.find_panel_type(id).map(|r| r.plugin_id.as_str()),
            CapabilityKey::PanelPrefix(prefix) => {
                let prefix = prefix.to_ascii_lowercase();
                self.prefixes
                    .iter()
                    .find(|p| p.prefix == prefix)
                    .map(|p| p.route.plugin_id.as_str())
            }
        }
    }

    pub fn find_hardware(&self, vendor_id: u16, product_id: u16) -> Option<&str> {
        self.hardware.get(&(vendor_id, product_id)).map(String::as_str)
    }

    pub fn find_protocol(&self, protocol_id: &str) -> Option<&str> {
        self.protocols.get(&protocol_id.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn find_panel_type(&self, type_id: &str) -> Option<&PanelRoute> {
        self.panel_types.get(&type_id.to_ascii_lowercase())
    }

    /// Resolve a panel input such as `clock` or `video:path/to/file.mp4`.
    ///
    /// Exact type ids win, then the longest registered prefix, then the text
    /// before the first `:` as a type id.
    pub fn resolve_panel_input(&self, input: &str) -> Option<ResolvedPanel> {
        let input = input.trim();
        if let Some(route) = self.find_panel_type(input) {
            return Some(ResolvedPanel {
                plugin_id: route.plugin_id.clone(),
                type_id: route.type_id.clone(),
                argument: None,
            });
        }

        for prefix in &self.prefixes {
            let matches = input
                .get(..prefix.prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(&prefix.prefix));
            if matches {
                return Some(ResolvedPanel {
                    plugin_id: prefix.route.plugin_id.clone(),
                    type_id: prefix.route.type_id.clone(),
                    argument: non_empty_argument(&input[prefix.prefix.len()..]),
                });
            }
        }

        let (head, rest) = input.split_once(':')?;
        let route = self.find_panel_type(head)?;
        Some(ResolvedPanel {
            plugin_id: route.plugin_id.clone(),
            type_id: route.type_id.clone(),
            argument: non_empty_argument(rest),
        })
    }

    /// Hardware routes sorted by key.
    pub fn hardware_routes(&self) -> Vec<((u16, u16), &str)> {
        let mut routes: Vec<_> = self.hardware.iter().map(|(k, v)| (*k, v.as_str())).collect();
        routes.sort();
        routes
    }

    /// Protocol routes sorted by key.
    pub fn protocol_routes(&self) -> Vec<(&str, &str)> {
        let mut routes: Vec<_> = self
            .protocols
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        routes.sort();
        routes
    }

    /// Panel-type routes sorted by key.
    pub fn panel_type_routes(&self) -> Vec<(&str, &PanelRoute)> {
        let mut routes: Vec<_> = self.panel_types.iter().map(|(k, v)| (k.as_str(), v)).collect();
        routes.sort_by(|a, b| a.0.cmp(b.0));
        routes
    }

    /// Prefix routes, longest first.
    pub fn prefix_routes(&self) -> Vec<(&str, &PanelRoute)> {
        self.prefixes.iter().map(|p| (p.prefix.as_str(), &p.route)).collect()
    }

    /// Every plugin id referenced by a route.
    pub fn owners(&self) -> impl Iterator<Item = &str> {
        self.hardware
            .values()
            .chain(self.protocols.values())
            .map(String::as_str)
            .chain(self.panel_types.values().map(|r| r.plugin_id.as_str()))
            .chain(self.prefixes.iter().map(|p| p.route.plugin_id.as_str()))
    }

    /// Total number of routed keys.
    pub fn len(&self) -> usize {
        self.hardware.len() + self.protocols.len() + self.panel_types.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn non_empty_argument(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Builds a [`RoutingTable`] with last-wins semantics.
#[derive(Debug, Default)]
pub struct RoutingTableBuilder {
    table: RoutingTable,
    overrides: Vec<RouteOverride>,
}

impl RoutingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_hardware(&mut self, vendor_id: u16, product_id: u16, plugin_id: &str) -> Option<RouteOverride> {
        let previous = self
            .table
            .hardware
            .insert((vendor_id, product_id), plugin_id.to_string());
        self.note_override(CapabilityKey::hardware(vendor_id, product_id), previous, plugin_id)
    }

    pub fn register_protocol(&mut self, protocol_id: &str, plugin_id: &str) -> Option<RouteOverride> {
        let previous = self
            .table
            .protocols
            .insert(protocol_id.to_ascii_lowercase(), plugin_id.to_string());
        self.note_override(CapabilityKey::protocol(protocol_id), previous, plugin_id)
    }

    pub fn register_panel_type(&mut self, key: &str, type_id: &str, plugin_id: &str) -> Option<RouteOverride> {
        let previous = self.table.panel_types.insert(
            key.to_ascii_lowercase(),
            PanelRoute {
                plugin_id: plugin_id.to_string(),
                type_id: type_id.to_string(),
            },
        );
        self.note_override(
            CapabilityKey::panel_type(key),
            previous.map(|r| r.plugin_id),
            plugin_id,
        )
    }

    /// Register an input prefix and the type id derived from it.
    ///
    /// `video:` also routes the bare key `video`.
    pub fn register_panel_prefix(&mut self, prefix: &str, type_id: &str, plugin_id: &str) -> Vec<RouteOverride> {
        let mut overrides = Vec::new();
        let lowered = prefix.to_ascii_lowercase();
        let route = PanelRoute {
            plugin_id: plugin_id.to_string(),
            type_id: type_id.to_string(),
        };

        let previous = match self.table.prefixes.iter_mut().find(|p| p.prefix == lowered) {
            Some(existing) => Some(std::mem::replace(&mut existing.route, route).plugin_id),
            None => {
                self.table.prefixes.push(PrefixRoute {
                    prefix: lowered,
                    route,
                });
                None
            }
        };
        overrides.extend(self.note_override(CapabilityKey::PanelPrefix(prefix.to_string()), previous, plugin_id));

        let derived = prefix.trim_end_matches(|c: char| c == ':' || c == '/' || c.is_whitespace());
        if !derived.is_empty() && !derived.eq_ignore_ascii_case(type_id) {
            overrides.extend(self.register_panel_type(derived, type_id, plugin_id));
        }
        overrides
    }

    fn note_override(&mut self, key: CapabilityKey, previous: Option<String>, plugin_id: &str) -> Option<RouteOverride> {
        let previous = previous?;
        if previous.eq_ignore_ascii_case(plugin_id) {
            return None;
        }
        tracing::warn!(
            key = %key,
            previous = %previous,
            replacement = %plugin_id,
            "Capability route overridden by another plugin"
        );
        let record = RouteOverride {
            key,
            previous,
            replacement: plugin_id.to_string(),
        };
        self.overrides.push(record.clone());
        Some(record)
    }

    /// Overrides recorded so far.
    pub fn overrides(&self) -> &[RouteOverride] {
        &self.overrides
    }

    pub fn build(mut self) -> RoutingTable {
        self.table
            .prefixes
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()).then_with(|| a.prefix.cmp(&b.prefix)));
        self.table
    }
}
