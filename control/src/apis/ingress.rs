//! Ingress routing policy
//!
//! An Ingress produces a route when it belongs to the configured ingress
//! class and names the subdomain it serves. The route is keyed by that
//! subdomain, not by the resource name.
//!
//! The backend address comes from an annotation written by the ingress
//! controller rather than from `status.loadBalancer`, so a route does not
//! wait on status propagation.

use super::RoutePolicy;
use crate::config::FilterConfig;
use common::{Admission, RouteRecord};
use k8s_openapi::api::networking::v1::Ingress;
use std::net::IpAddr;

/// Annotation selecting the ingress controller
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Annotation requesting certificate issuance
pub const CLUSTER_ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";

/// Ingress filter + normalizer
#[derive(Debug, Clone)]
pub struct IngressPolicy {
    ingress_class: String,
    cluster_issuer: String,
    subdomain_annotation: String,
    ip_annotation: String,
}

impl IngressPolicy {
    pub fn new(
        ingress_class: impl Into<String>,
        cluster_issuer: impl Into<String>,
        subdomain_annotation: impl Into<String>,
        ip_annotation: impl Into<String>,
    ) -> Self {
        Self {
            ingress_class: ingress_class.into(),
            cluster_issuer: cluster_issuer.into(),
            subdomain_annotation: subdomain_annotation.into(),
            ip_annotation: ip_annotation.into(),
        }
    }

    pub fn from_filters(filters: &FilterConfig) -> Self {
        Self::new(
            filters.ingress_class.clone(),
            filters.cluster_issuer.clone(),
            filters.subdomain_annotation.clone(),
            filters.ip_annotation.clone(),
        )
    }
}

fn annotation<'a>(ingress: &'a Ingress, key: &str) -> Option<&'a str> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

impl RoutePolicy<Ingress> for IngressPolicy {
    fn kind(&self) -> &'static str {
        "Ingress"
    }

    fn accepts(&self, ingress: &Ingress) -> bool {
        annotation(ingress, INGRESS_CLASS_ANNOTATION) == Some(self.ingress_class.as_str())
            && annotation(ingress, &self.subdomain_annotation).is_some()
    }

    fn route_name(&self, ingress: &Ingress) -> Option<String> {
        annotation(ingress, &self.subdomain_annotation).map(str::to_string)
    }

    fn admit(&self, ingress: &Ingress) -> Admission {
        if !self.accepts(ingress) {
            return Admission::Rejected;
        }

        let Some(name) = self.route_name(ingress) else {
            return Admission::Rejected;
        };

        let Some(ip) = annotation(ingress, &self.ip_annotation) else {
            return Admission::Deferred {
                name,
                reason: "ingress controller address annotation not set",
            };
        };

        if ip.parse::<IpAddr>().is_err() {
            return Admission::Deferred {
                name,
                reason: "ingress controller address is not an IP",
            };
        }

        let issuer_requested =
            annotation(ingress, CLUSTER_ISSUER_ANNOTATION) == Some(self.cluster_issuer.as_str());

        Admission::Accepted(RouteRecord::new(name, ip, issuer_requested))
    }
}
