//! Controller lifecycle
//!
//! Startup order: load the persisted table, rebuild from the cluster, replace
//! the table, then run both watch loops against the single store writer until
//! shutdown. On shutdown the loops stop first, then the writer drains.

use crate::apis::ingress::IngressPolicy;
use crate::apis::service::ServicePolicy;
use crate::apis::watch::{ResourceWatch, WatchLoop};
use crate::bootstrap;
use crate::error::Result;
use crate::retry::BackoffConfig;
use crate::routes::RouteChange;
use crate::store::writer::{StoreWriter, WriteOutcome};
use crate::store::{ConfigStore, VersionControl};
use common::{RoutingDocument, TablePolicy};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Wires watch sources, policies and the store together
pub struct Supervisor<I, S, V> {
    ingresses: I,
    services: S,
    ingress_policy: IngressPolicy,
    service_policy: ServicePolicy,
    store: ConfigStore<V>,
    table_policy: TablePolicy,
    backoff: BackoffConfig,
}

impl<I, S, V> Supervisor<I, S, V>
where
    I: ResourceWatch<Ingress> + 'static,
    S: ResourceWatch<Service> + 'static,
    V: VersionControl + 'static,
{
    pub fn new(
        ingresses: I,
        services: S,
        ingress_policy: IngressPolicy,
        service_policy: ServicePolicy,
        store: ConfigStore<V>,
    ) -> Self {
        Self {
            ingresses,
            services,
            ingress_policy,
            service_policy,
            store,
            table_policy: TablePolicy::default(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_table_policy(mut self, policy: TablePolicy) -> Self {
        self.table_policy = policy;
        self
    }

    /// Reconnect and save-retry timing
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until `shutdown` is cancelled. Returns the final table.
    ///
    /// Fails only during startup (cluster listing); once the watch loops
    /// run, every error is handled inside them.
    pub async fn run(self, shutdown: CancellationToken) -> Result<RoutingDocument> {
        let persisted = match self.store.load().await {
            Ok(document) => document,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted routing document, starting empty");
                RoutingDocument::new()
            }
        };

        let rebuild = bootstrap::rebuild(
            &self.ingresses,
            &self.services,
            &self.ingress_policy,
            &self.service_policy,
        )
        .await?;

        let diff = persisted.diff(&rebuild.to_document(&self.table_policy));
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "Reconciled persisted table against cluster state"
        );

        let (handle, writer) = StoreWriter::spawn(
            self.store,
            persisted,
            self.table_policy.clone(),
            &self.backoff,
        );

        match handle.apply(RouteChange::Replace(rebuild.records)).await? {
            WriteOutcome::SaveFailed => {
                warn!("Initial routing table save failed, will retry in the background")
            }
            outcome => info!(outcome = ?outcome, "Initial routing table written"),
        }

        let ingress_loop = WatchLoop::new(
            self.ingresses,
            self.ingress_policy,
            handle.clone(),
            &self.backoff,
        )
        .with_checkpoint(rebuild.ingress_checkpoint);
        let service_loop = WatchLoop::new(
            self.services,
            self.service_policy,
            handle.clone(),
            &self.backoff,
        )
        .with_checkpoint(rebuild.service_checkpoint);
        drop(handle);

        let ingress_task = tokio::spawn(ingress_loop.run(shutdown.clone()));
        let service_task = tokio::spawn(service_loop.run(shutdown.clone()));
        info!("Watching Ingress and Service resources");

        let (ingress_result, service_result) = tokio::join!(ingress_task, service_task);
        for (kind, result) in [("Ingress", ingress_result), ("Service", service_result)] {
            if let Err(e) = result {
                error!(kind, error = %e, "Watch loop task failed");
            }
        }

        // Both loops are gone, so the writer sees its queue close and drains
        let document = match writer.await {
            Ok(document) => document,
            Err(e) => {
                error!(error = %e, "Store writer task failed");
                RoutingDocument::new()
            }
        };

        info!(routes = document.routes.len(), "Controller stopped");
        Ok(document)
    }
}
