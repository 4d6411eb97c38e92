//! EdgeSync Common Types
//!
//! Routing table model shared by the control plane: the canonical route
//! derived from a cluster resource, the persisted document the external
//! load balancer reads, and the table operations that mutate it.
//!
//! Nothing in here performs I/O. The control crate owns watching, storage
//! and version control; this crate only decides what the document looks
//! like after a change.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Port written for routed (TLS-terminated) traffic
pub const ROUTE_PORT: u16 = 443;

/// Port written for TLS-issuance challenge traffic
pub const ACME_PORT: u16 = 80;

/// Errors raised while reading or checking a routing document
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("failed to parse routing document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("routing document invariant violated: {0}")]
    Invariant(String),
}

/// Canonical route derived from one accepted cluster resource
///
/// Only produced once a backend address is known; resources without an
/// address are reported as [`Admission::Deferred`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteRecord {
    /// Table key (subdomain for Ingress, resource name for Service)
    pub name: String,

    /// Backend address
    pub ip: String,

    /// Source resource asked for automated certificate issuance
    pub issuer_requested: bool,
}

impl RouteRecord {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, issuer_requested: bool) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            issuer_requested,
        }
    }
}

/// Result of running a resource through a routing policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Resource matches the policy and is ready to route
    Accepted(RouteRecord),

    /// Resource matches the policy but has no backend address yet.
    /// Re-evaluated on the next MODIFIED event.
    Deferred { name: String, reason: &'static str },

    /// Resource does not match the policy (no-op)
    Rejected,
}

impl Admission {
    /// Collapse into the routable record, if any
    pub fn into_record(self) -> Option<RouteRecord> {
        match self {
            Admission::Accepted(record) => Some(record),
            _ => None,
        }
    }
}

/// Per-table constants applied on every upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePolicy {
    /// Port for entries in `routes`
    pub route_port: u16,

    /// Port for entries in `acmeRoutes`
    pub acme_port: u16,

    /// Drop the `acmeRoutes` entry when an upsert no longer requests issuance.
    /// Off by default: certificates are not de-provisioned automatically.
    pub prune_stale_acme: bool,
}

impl Default for TablePolicy {
    fn default() -> Self {
        Self {
            route_port: ROUTE_PORT,
            acme_port: ACME_PORT,
            prune_stale_acme: false,
        }
    }
}

/// One serialized entry of `routes` or `acmeRoutes`
///
/// Field names are read by the load balancer's config loader and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub name: String,

    pub ip: Option<String>,

    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_enabled: Option<bool>,
}

/// Persisted routing document
///
/// `routes` and `acmeRoutes` are ordered sequences keyed by `name`. The order
/// carries no meaning for the load balancer; it is kept stable so commits
/// only show the entries that actually changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDocument {
    #[serde(default)]
    pub routes: Vec<RouteEntry>,

    #[serde(default)]
    pub acme_routes: Vec<RouteEntry>,

    /// Top-level keys owned by someone else, carried through untouched
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

/// Name-level difference between two documents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl DocumentDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl RoutingDocument {
    /// Empty skeleton (both tables present, no entries)
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a document. Empty or `null` content yields the empty skeleton.
    pub fn from_yaml(content: &str) -> Result<Self, DocumentError> {
        let value: serde_yaml::Value = if content.trim().is_empty() {
            serde_yaml::Value::Null
        } else {
            serde_yaml::from_str(content)?
        };

        if value.is_null() {
            return Ok(Self::new());
        }

        Ok(serde_yaml::from_value(value)?)
    }

    /// Render the canonical on-disk form
    pub fn to_yaml(&self) -> Result<String, DocumentError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn route(&self, name: &str) -> Option<&RouteEntry> {
        self.routes.iter().find(|e| e.name == name)
    }

    pub fn acme_route(&self, name: &str) -> Option<&RouteEntry> {
        self.acme_routes.iter().find(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.route(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.acme_routes.is_empty()
    }

    /// Insert or update `record`. Returns true if the document changed.
    ///
    /// An existing entry keeps its position; its `ip` is overwritten and its
    /// `port`/`proxyEnabled` are reset to the table policy.
    pub fn upsert(&mut self, record: &RouteRecord, policy: &TablePolicy) -> bool {
        let mut changed = upsert_entry(
            &mut self.routes,
            &record.name,
            &record.ip,
            policy.route_port,
            Some(false),
        );

        if record.issuer_requested {
            changed |= upsert_entry(
                &mut self.acme_routes,
                &record.name,
                &record.ip,
                policy.acme_port,
                None,
            );
        } else if policy.prune_stale_acme {
            changed |= remove_entry(&mut self.acme_routes, &record.name);
        }

        changed
    }

    /// Remove `name` from both tables. Absence is a no-op.
    pub fn remove(&mut self, name: &str) -> bool {
        let from_routes = remove_entry(&mut self.routes, name);
        let from_acme = remove_entry(&mut self.acme_routes, name);
        from_routes || from_acme
    }

    /// Replace the whole table with `records`.
    ///
    /// The resulting name set is exactly the set of names in `records` (the
    /// last record wins for a repeated name). Surviving entries keep their
    /// previous positions, new names are appended in input order.
    pub fn replace_all(&mut self, records: &[RouteRecord], policy: &TablePolicy) -> bool {
        let mut latest: HashMap<&str, &RouteRecord> = HashMap::with_capacity(records.len());
        for record in records {
            latest.insert(record.name.as_str(), record);
        }

        let mut next = RoutingDocument {
            routes: Vec::with_capacity(latest.len()),
            acme_routes: Vec::new(),
            extra: self.extra.clone(),
        };

        {
            let mut seen: HashSet<&str> = HashSet::new();
            for entry in &self.routes {
                if latest.contains_key(entry.name.as_str()) && seen.insert(entry.name.as_str()) {
                    next.routes.push(entry.clone());
                }
            }

            seen.clear();
            for entry in &self.acme_routes {
                let wanted = latest
                    .get(entry.name.as_str())
                    .is_some_and(|r| r.issuer_requested);
                if wanted && seen.insert(entry.name.as_str()) {
                    next.acme_routes.push(entry.clone());
                }
            }
        }

        for record in records {
            let is_latest = latest
                .get(record.name.as_str())
                .is_some_and(|r| std::ptr::eq(*r, record));
            if is_latest {
                next.upsert(record, policy);
            }
        }

        let changed = next != *self;
        *self = next;
        changed
    }

    /// Check the structural invariants: unique names per table and every
    /// `acmeRoutes` name present in `routes`.
    pub fn validate(&self) -> Result<(), DocumentError> {
        if let Some(name) = first_duplicate(&self.routes) {
            return Err(DocumentError::Invariant(format!(
                "duplicate name '{}' in routes",
                name
            )));
        }

        if let Some(name) = first_duplicate(&self.acme_routes) {
            return Err(DocumentError::Invariant(format!(
                "duplicate name '{}' in acmeRoutes",
                name
            )));
        }

        if let Some(orphan) = self.acme_routes.iter().find(|e| !self.contains(&e.name)) {
            return Err(DocumentError::Invariant(format!(
                "acmeRoutes entry '{}' has no matching route",
                orphan.name
            )));
        }

        Ok(())
    }

    /// Drop duplicate names (first occurrence wins) and orphaned
    /// `acmeRoutes` entries. Returns the number of entries dropped.
    pub fn repair(&mut self) -> usize {
        let before = self.routes.len() + self.acme_routes.len();

        dedupe(&mut self.routes);
        dedupe(&mut self.acme_routes);

        let names: HashSet<String> = self.routes.iter().map(|e| e.name.clone()).collect();
        self.acme_routes.retain(|e| names.contains(&e.name));

        before - (self.routes.len() + self.acme_routes.len())
    }

    /// Names whose routing changed between `self` and `next`
    pub fn diff(&self, next: &RoutingDocument) -> DocumentDiff {
        let mut diff = DocumentDiff::default();

        for entry in &next.routes {
            match self.route(&entry.name) {
                None => diff.added.push(entry.name.clone()),
                Some(old) => {
                    let acme_changed =
                        self.acme_route(&entry.name) != next.acme_route(&entry.name);
                    if old != entry || acme_changed {
                        diff.changed.push(entry.name.clone());
                    }
                }
            }
        }

        for entry in &self.routes {
            if !next.contains(&entry.name) {
                diff.removed.push(entry.name.clone());
            }
        }

        diff
    }
}

fn upsert_entry(
    entries: &mut Vec<RouteEntry>,
    name: &str,
    ip: &str,
    port: u16,
    proxy_enabled: Option<bool>,
) -> bool {
    match entries.iter_mut().find(|e| e.name == name) {
        Some(entry) => {
            let unchanged = entry.ip.as_deref() == Some(ip)
                && entry.port == port
                && entry.proxy_enabled == proxy_enabled;
            if unchanged {
                return false;
            }
            entry.ip = Some(ip.to_string());
            entry.port = port;
            entry.proxy_enabled = proxy_enabled;
            true
        }
        None => {
            entries.push(RouteEntry {
                name: name.to_string(),
                ip: Some(ip.to_string()),
                port,
                proxy_enabled,
            });
            true
        }
    }
}

fn remove_entry(entries: &mut Vec<RouteEntry>, name: &str) -> bool {
    let before = entries.len();
    entries.retain(|e| e.name != name);
    entries.len() != before
}

fn first_duplicate(entries: &[RouteEntry]) -> Option<&str> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .map(|e| e.name.as_str())
        .find(|name| !seen.insert(*name))
}

fn dedupe(entries: &mut Vec<RouteEntry>) {
    let mut seen = HashSet::new();
    entries.retain(|e| seen.insert(e.name.clone()));
}
