//! Startup rebuild of the routing table from current cluster state
//!
//! Lists every Ingress and Service once, runs them through the same
//! policies the watch loops use, and produces the full record set that
//! replaces the persisted table. The collection versions of both listings
//! become the starting checkpoints of the watch loops.

use crate::apis::watch::{ResourceWatch, WatchCheckpoint};
use crate::apis::RoutePolicy;
use crate::error::Result;
use common::{Admission, RouteRecord, RoutingDocument, TablePolicy};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use tracing::{debug, info};

/// Outcome of one bootstrap pass
#[derive(Debug, Clone, Default)]
pub struct Rebuild {
    /// Ingress-derived records first, then Service-derived, in list order
    pub records: Vec<RouteRecord>,
    pub ingress_checkpoint: WatchCheckpoint,
    pub service_checkpoint: WatchCheckpoint,
    /// Accepted resources still waiting for an address
    pub deferred: Vec<String>,
}

impl Rebuild {
    /// Routing table holding exactly the rebuilt records
    pub fn to_document(&self, policy: &TablePolicy) -> RoutingDocument {
        let mut document = RoutingDocument::new();
        document.replace_all(&self.records, policy);
        document
    }
}

/// List both kinds and derive the full record set. A listing failure is
/// fatal to startup and is returned as is.
pub async fn rebuild<I, S, IP, SP>(
    ingresses: &I,
    services: &S,
    ingress_policy: &IP,
    service_policy: &SP,
) -> Result<Rebuild>
where
    I: ResourceWatch<Ingress>,
    S: ResourceWatch<Service>,
    IP: RoutePolicy<Ingress>,
    SP: RoutePolicy<Service>,
{
    let mut rebuild = Rebuild::default();

    let snapshot = ingresses.list().await?;
    rebuild.ingress_checkpoint = snapshot.checkpoint();
    collect(&snapshot.items, ingress_policy, &mut rebuild);

    let snapshot = services.list().await?;
    rebuild.service_checkpoint = snapshot.checkpoint();
    collect(&snapshot.items, service_policy, &mut rebuild);

    info!(
        routes = rebuild.records.len(),
        deferred = rebuild.deferred.len(),
        ingress_version = %rebuild.ingress_checkpoint,
        service_version = %rebuild.service_checkpoint,
        "Rebuilt routing table from cluster state"
    );
    Ok(rebuild)
}

fn collect<K, P: RoutePolicy<K>>(items: &[K], policy: &P, rebuild: &mut Rebuild) {
    for item in items {
        match policy.admit(item) {
            Admission::Accepted(record) => rebuild.records.push(record),
            Admission::Deferred { name, reason } => {
                debug!(kind = policy.kind(), route = %name, reason, "Deferred during rebuild");
                rebuild.deferred.push(name);
            }
            Admission::Rejected => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::ingress::IngressPolicy;
    use crate::apis::service::ServicePolicy;
    use crate::apis::watch::{EventStream, Snapshot};
    use crate::error::SyncError;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    struct Listed<K> {
        items: Vec<K>,
        version: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl<K: Clone + Send + Sync + 'static> ResourceWatch<K> for Listed<K> {
        async fn list(&self) -> Result<Snapshot<K>> {
            if self.fail {
                return Err(SyncError::config("apiserver unreachable"));
            }
            Ok(Snapshot {
                items: self.items.clone(),
                resource_version: Some(self.version.to_string()),
            })
        }

        async fn watch(&self, _checkpoint: &WatchCheckpoint) -> Result<EventStream<K>> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    fn ingress(name: &str, subdomain: &str, ip: Option<&str>) -> Ingress {
        let mut annotations = BTreeMap::from([
            ("kubernetes.io/ingress.class".to_string(), "nginx".to_string()),
            (
                "external-dns.alpha.kubernetes.io/hostname".to_string(),
                subdomain.to_string(),
            ),
        ]);
        if let Some(ip) = ip {
            annotations.insert(
                "external-dns.alpha.kubernetes.io/target".to_string(),
                ip.to_string(),
            );
        }
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn service(name: &str, ip: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([("external".to_string(), "true".to_string())])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ..Default::default()
            }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
        }
    }

    fn policies() -> (IngressPolicy, ServicePolicy) {
        (
            IngressPolicy::new(
                "nginx",
                "letsencrypt-production",
                "external-dns.alpha.kubernetes.io/hostname",
                "external-dns.alpha.kubernetes.io/target",
            ),
            ServicePolicy::new("external"),
        )
    }

    #[tokio::test]
    async fn test_rebuild_collects_both_kinds() {
        let ingresses = Listed {
            items: vec![
                ingress("web", "web.example.com", Some("10.0.0.5")),
                ingress("pending", "pending.example.com", None),
            ],
            version: "100",
            fail: false,
        };
        let services = Listed {
            items: vec![service("mqtt", "10.0.0.9")],
            version: "200",
            fail: false,
        };
        let (ingress_policy, service_policy) = policies();

        let rebuild = rebuild(&ingresses, &services, &ingress_policy, &service_policy)
            .await
            .expect("rebuild");

        let names: Vec<&str> = rebuild.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["web.example.com", "mqtt"]);
        assert_eq!(rebuild.deferred, vec!["pending.example.com".to_string()]);
        assert_eq!(rebuild.ingress_checkpoint.version(), "100");
        assert_eq!(rebuild.service_checkpoint.version(), "200");

        let doc = rebuild.to_document(&TablePolicy::default());
        assert!(doc.contains("web.example.com"));
        assert!(doc.contains("mqtt"));
        assert!(!doc.contains("pending.example.com"));
    }

    #[tokio::test]
    async fn test_list_failure_is_returned() {
        let ingresses = Listed::<Ingress> {
            items: vec![],
            version: "1",
            fail: true,
        };
        let services = Listed::<Service> {
            items: vec![],
            version: "1",
            fail: false,
        };
        let (ingress_policy, service_policy) = policies();

        let result = rebuild(&ingresses, &services, &ingress_policy, &service_policy).await;
        assert!(result.is_err());
    }
}
