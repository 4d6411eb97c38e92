//! Route changes flowing from the watch loops into the store writer

use common::{RouteRecord, RoutingDocument, TablePolicy};
use std::fmt;

/// One mutation of the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteChange {
    /// ADDED / MODIFIED with a known address
    Upsert(RouteRecord),

    /// DELETED, by table key
    Remove(String),

    /// Full snapshot from the bootstrap rebuild (replace, not merge)
    Replace(Vec<RouteRecord>),
}

impl RouteChange {
    /// Apply to `document`. Returns true if the document changed.
    pub fn apply(&self, document: &mut RoutingDocument, policy: &TablePolicy) -> bool {
        match self {
            RouteChange::Upsert(record) => document.upsert(record, policy),
            RouteChange::Remove(name) => document.remove(name),
            RouteChange::Replace(records) => document.replace_all(records, policy),
        }
    }

    /// A rebuild is always written out, even when the table already matches,
    /// so the working copy gets the canonical rendering.
    pub fn forces_save(&self) -> bool {
        matches!(self, RouteChange::Replace(_))
    }
}

impl fmt::Display for RouteChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteChange::Upsert(record) => write!(f, "upsert {}", record.name),
            RouteChange::Remove(name) => write!(f, "remove {}", name),
            RouteChange::Replace(records) => write!(f, "rebuild ({} routes)", records.len()),
        }
    }
}
