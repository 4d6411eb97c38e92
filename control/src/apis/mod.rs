//! Kubernetes API integrations
//!
//! Watch sources for Ingress and Service resources, and the routing policies
//! that turn those resources into route records.

pub mod ingress;
pub mod metrics;
pub mod service;
pub mod watch;

use common::Admission;

/// Filter and normalizer for one resource kind
///
/// Both watch loops and the bootstrap rebuild go through the same policy, so
/// a resource is judged identically whether it arrives in a snapshot or as
/// an event.
pub trait RoutePolicy<K>: Send + Sync {
    /// Resource kind for logs and metrics
    fn kind(&self) -> &'static str;

    /// Whether the resource belongs in the routing table at all
    fn accepts(&self, resource: &K) -> bool;

    /// Table key for an accepted resource
    fn route_name(&self, resource: &K) -> Option<String>;

    /// Accept predicate plus normalization in one step
    fn admit(&self, resource: &K) -> Admission;
}
