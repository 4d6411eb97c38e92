//! Single writer for the routing document
//!
//! Both watch loops send their changes to one task that owns the in-memory
//! document and the store. Changes are applied and saved strictly one at a
//! time, and each sender waits for the outcome of its own change.

use super::{ConfigStore, SaveOutcome, VersionControl};
use crate::apis::metrics::{record_store_save, set_route_counts};
use crate::error::{Result, SyncError};
use crate::retry::{Backoff, BackoffConfig};
use crate::routes::RouteChange;
use common::{RoutingDocument, TablePolicy};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

const QUEUE_DEPTH: usize = 64;

/// Result of one change as seen by its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Change was a no-op; nothing written
    Unchanged,
    Saved(SaveOutcome),
    /// Table updated in memory but not persisted; retried later
    SaveFailed,
}

struct WriteRequest {
    change: RouteChange,
    ack: oneshot::Sender<WriteOutcome>,
}

/// Cloneable sender side of the writer
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl StoreHandle {
    /// Queue a change and wait until it has been applied and saved
    pub async fn apply(&self, change: RouteChange) -> Result<WriteOutcome> {
        let (ack, outcome) = oneshot::channel();
        self.tx
            .send(WriteRequest { change, ack })
            .await
            .map_err(|_| SyncError::StoreClosed)?;
        outcome.await.map_err(|_| SyncError::StoreClosed)
    }
}

/// Owner of the document and the store
pub struct StoreWriter<V> {
    store: ConfigStore<V>,
    document: RoutingDocument,
    policy: TablePolicy,
    backoff: Backoff,
    /// Commit message of the last failed save; set while the working copy
    /// is behind the in-memory table
    pending: Option<String>,
    retry_at: Option<Instant>,
}

impl<V: VersionControl + 'static> StoreWriter<V> {
    /// Start the writer task. It runs until every [`StoreHandle`] is dropped,
    /// then drains the queue and returns the final document.
    pub fn spawn(
        store: ConfigStore<V>,
        document: RoutingDocument,
        policy: TablePolicy,
        retry: &BackoffConfig,
    ) -> (StoreHandle, JoinHandle<RoutingDocument>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let writer = Self {
            store,
            document,
            policy,
            backoff: retry.build(),
            pending: None,
            retry_at: None,
        };

        (StoreHandle { tx }, tokio::spawn(writer.run(rx)))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WriteRequest>) -> RoutingDocument {
        self.publish_counts();
        debug!("Store writer started");

        loop {
            let request = match self.retry_at {
                Some(deadline) => tokio::select! {
                    request = rx.recv() => request,
                    _ = tokio::time::sleep_until(deadline) => {
                        self.retry().await;
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            let Some(WriteRequest { change, ack }) = request else {
                break;
            };

            let outcome = self.apply(change).await;
            // Sender may have given up waiting; the change is applied anyway
            let _ = ack.send(outcome);
        }

        if self.pending.is_some() {
            self.retry().await;
        }
        info!(
            routes = self.document.routes.len(),
            acme_routes = self.document.acme_routes.len(),
            "Store writer stopped"
        );
        self.document
    }

    async fn apply(&mut self, change: RouteChange) -> WriteOutcome {
        let changed = change.apply(&mut self.document, &self.policy);
        if changed {
            self.publish_counts();
        }

        // A dirty writer saves on every change, even a no-op one
        if !changed && !change.forces_save() && self.pending.is_none() {
            return WriteOutcome::Unchanged;
        }

        self.save(format!("edgesync: {}", change)).await
    }

    async fn save(&mut self, message: String) -> WriteOutcome {
        let started = std::time::Instant::now();

        match self.store.save(&self.document, &message).await {
            Ok(outcome) => {
                record_store_save(outcome_label(outcome), started.elapsed().as_secs_f64());
                if outcome == SaveOutcome::Unchanged {
                    debug!(change = %message, "Routing document already up to date");
                } else {
                    info!(change = %message, outcome = ?outcome, "Routing document saved");
                }
                self.pending = None;
                self.retry_at = None;
                self.backoff.reset();
                WriteOutcome::Saved(outcome)
            }
            Err(e) => {
                record_store_save("failed", started.elapsed().as_secs_f64());
                let delay = self.backoff.next_delay();
                error!(
                    change = %message,
                    error = %e,
                    failures = self.backoff.failures(),
                    retry_in = ?delay,
                    "Failed to save routing document"
                );
                self.pending = Some(message);
                self.retry_at = Some(Instant::now() + delay);
                WriteOutcome::SaveFailed
            }
        }
    }

    async fn retry(&mut self) {
        if let Some(message) = self.pending.clone() {
            info!(change = %message, "Retrying routing document save");
            self.save(message).await;
        }
    }

    fn publish_counts(&self) {
        set_route_counts(self.document.routes.len(), self.document.acme_routes.len());
    }
}

fn outcome_label(outcome: SaveOutcome) -> &'static str {
    match outcome {
        SaveOutcome::Unchanged => "unchanged",
        SaveOutcome::Pushed => "pushed",
        SaveOutcome::Flushed => "flushed",
    }
}
