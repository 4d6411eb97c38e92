//! Service routing policy
//!
//! A Service produces a route when it is of type `LoadBalancer` and carries
//! the external-marker label. The route is keyed by the Service name and
//! points at the first address in `status.loadBalancer.ingress`. Until the
//! cloud provider assigns one, the Service is deferred.

use super::RoutePolicy;
use common::{Admission, RouteRecord};
use k8s_openapi::api::core::v1::Service;

/// External-marker label selector: `key` or `key=value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    key: String,
    value: Option<String>,
}

impl LabelSelector {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((key, value)) => Self {
                key: key.trim().to_string(),
                value: Some(value.trim().to_string()),
            },
            None => Self {
                key: raw.trim().to_string(),
                value: None,
            },
        }
    }

    pub fn matches(&self, service: &Service) -> bool {
        let Some(labels) = service.metadata.labels.as_ref() else {
            return false;
        };

        match (&self.value, labels.get(&self.key)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(expected), Some(actual)) => expected == actual,
        }
    }
}

/// Service filter + normalizer
#[derive(Debug, Clone)]
pub struct ServicePolicy {
    external_label: LabelSelector,
}

impl ServicePolicy {
    pub fn new(external_label: &str) -> Self {
        Self {
            external_label: LabelSelector::parse(external_label),
        }
    }
}

fn load_balancer_ip(service: &Service) -> Option<&str> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?
        .ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
}

impl RoutePolicy<Service> for ServicePolicy {
    fn kind(&self) -> &'static str {
        "Service"
    }

    fn accepts(&self, service: &Service) -> bool {
        let is_load_balancer = service
            .spec
            .as_ref()
            .and_then(|spec| spec.type_.as_deref())
            == Some("LoadBalancer");

        is_load_balancer && self.external_label.matches(service)
    }

    fn route_name(&self, service: &Service) -> Option<String> {
        service.metadata.name.clone()
    }

    fn admit(&self, service: &Service) -> Admission {
        if !self.accepts(service) {
            return Admission::Rejected;
        }

        let Some(name) = self.route_name(service) else {
            return Admission::Rejected;
        };

        match load_balancer_ip(service) {
            Some(ip) => Admission::Accepted(RouteRecord::new(name, ip, false)),
            None => Admission::Deferred {
                name,
                reason: "load balancer address not assigned yet",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn service(name: &str, type_: &str, labels: &[(&str, &str)], ip: Option<&str>) -> Service {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ..Default::default()
            }),
            status: ip.map(|ip| ServiceStatus {
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

    #[test]
    fn test_labelled_load_balancer_is_accepted() {
        let policy = ServicePolicy::new("external");
        let svc = service(
            "mqtt",
            "LoadBalancer",
            &[("external", "true")],
            Some("192.168.1.40"),
        );

        assert_eq!(
            policy.admit(&svc),
            Admission::Accepted(RouteRecord::new("mqtt", "192.168.1.40", false))
        );
    }

    #[test]
    fn test_cluster_ip_service_is_rejected() {
        let policy = ServicePolicy::new("external");
        let svc = service("mqtt", "ClusterIP", &[("external", "true")], None);

        assert_eq!(policy.admit(&svc), Admission::Rejected);
    }

    #[test]
    fn test_unlabelled_service_is_rejected() {
        let policy = ServicePolicy::new("external");
        let svc = service("mqtt", "LoadBalancer", &[("app", "mqtt")], Some("192.168.1.40"));

        assert_eq!(policy.admit(&svc), Admission::Rejected);
    }

    #[test]
    fn test_pending_address_is_deferred() {
        let policy = ServicePolicy::new("external");
        let svc = service("mqtt", "LoadBalancer", &[("external", "true")], None);

        assert_eq!(
            policy.admit(&svc),
            Admission::Deferred {
                name: "mqtt".to_string(),
                reason: "load balancer address not assigned yet",
            }
        );
    }

    #[test]
    fn test_label_value_selector() {
        let policy = ServicePolicy::new("external=true");

        let yes = service("a", "LoadBalancer", &[("external", "true")], Some("10.0.0.1"));
        let no = service("b", "LoadBalancer", &[("external", "false")], Some("10.0.0.2"));

        assert!(policy.accepts(&yes));
        assert!(!policy.accepts(&no));
    }

    #[test]
    fn test_label_presence_selector_ignores_value() {
        let selector = LabelSelector::parse("external");
        let svc = service("a", "LoadBalancer", &[("external", "")], None);

        assert!(selector.matches(&svc));
    }
}
