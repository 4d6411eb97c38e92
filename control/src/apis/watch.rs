//! Watch sources and the per-kind watch loop
//!
//! A [`ResourceWatch`] hands out one finite event stream per call; the
//! server closes it after the watch timeout. [`WatchLoop`] owns the
//! reconnect cycle around it: reopen on a normal end, back off on errors,
//! and resume from the last seen resource version.

use super::metrics::{record_watch_event, record_watch_reconnect, set_watch_connected};
use super::RoutePolicy;
use crate::error::{Result, SyncError};
use crate::retry::{Backoff, BackoffConfig};
use crate::routes::RouteChange;
use crate::store::writer::{StoreHandle, WriteOutcome};
use async_trait::async_trait;
use common::Admission;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{ListParams, WatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// API servers reject watch timeouts at or above 295s
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// A stream that ends sooner than this without delivering anything is
/// treated like a failure, so a misbehaving server cannot spin the loop.
const MIN_HEALTHY_SESSION: Duration = Duration::from_secs(1);

/// One change notification for a resource kind
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying only a resource version
    Bookmark(String),
}

impl<K> WatchEvent<K> {
    pub fn label(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
            WatchEvent::Bookmark(_) => "BOOKMARK",
        }
    }
}

/// Last seen stream position for one resource kind (in memory only)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchCheckpoint {
    resource_version: Option<String>,
}

impl WatchCheckpoint {
    pub fn at(resource_version: impl Into<String>) -> Self {
        Self {
            resource_version: Some(resource_version.into()),
        }
    }

    pub fn advance(&mut self, resource_version: impl Into<String>) {
        let version = resource_version.into();
        if !version.is_empty() {
            self.resource_version = Some(version);
        }
    }

    /// Forget the position; the next stream starts from current state
    pub fn reset(&mut self) {
        self.resource_version = None;
    }

    /// Version to resume from ("0" = any, served from the API server cache)
    pub fn version(&self) -> &str {
        self.resource_version.as_deref().unwrap_or("0")
    }

}

impl fmt::Display for WatchCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.version())
    }
}

/// Full listing of one kind plus the collection version it was taken at
#[derive(Debug, Clone)]
pub struct Snapshot<K> {
    pub items: Vec<K>,
    pub resource_version: Option<String>,
}

impl<K> Snapshot<K> {
    pub fn checkpoint(&self) -> WatchCheckpoint {
        match &self.resource_version {
            Some(version) => WatchCheckpoint::at(version.clone()),
            None => WatchCheckpoint::default(),
        }
    }
}

pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Source of listings and event streams for one resource kind
#[async_trait]
pub trait ResourceWatch<K: Send + 'static>: Send + Sync {
    /// List every object of the kind
    async fn list(&self) -> Result<Snapshot<K>>;

    /// Open one event stream starting after `checkpoint`. The stream ends
    /// normally when the server-side timeout expires.
    async fn watch(&self, checkpoint: &WatchCheckpoint) -> Result<EventStream<K>>;
}

/// Cluster-wide watch over the Kubernetes API
pub struct KubeWatch<K> {
    api: Api<K>,
    timeout_secs: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeWatch<K>
where
    K: Resource,
    K::DynamicType: Default,
{
    pub fn all(client: Client, timeout_secs: u32) -> Self {
        Self {
            api: Api::all(client),
            timeout_secs: timeout_secs.clamp(1, MAX_WATCH_TIMEOUT_SECS),
            _kind: PhantomData,
        }
    }
}

fn translate<K>(event: kube::api::WatchEvent<K>) -> Result<WatchEvent<K>> {
    match event {
        kube::api::WatchEvent::Added(obj) => Ok(WatchEvent::Added(obj)),
        kube::api::WatchEvent::Modified(obj) => Ok(WatchEvent::Modified(obj)),
        kube::api::WatchEvent::Deleted(obj) => Ok(WatchEvent::Deleted(obj)),
        kube::api::WatchEvent::Bookmark(bookmark) => Ok(WatchEvent::Bookmark(
            bookmark.metadata.resource_version,
        )),
        kube::api::WatchEvent::Error(status) if status.code == 410 => {
            Err(SyncError::WatchExpired(status.message))
        }
        kube::api::WatchEvent::Error(status) => {
            Err(SyncError::Kubernetes(kube::Error::Api(status)))
        }
    }
}

#[async_trait]
impl<K> ResourceWatch<K> for KubeWatch<K>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn list(&self) -> Result<Snapshot<K>> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(Snapshot {
            resource_version: list.metadata.resource_version.clone(),
            items: list.items,
        })
    }

    async fn watch(&self, checkpoint: &WatchCheckpoint) -> Result<EventStream<K>> {
        let params = WatchParams::default().timeout(self.timeout_secs);
        let stream = self.api.watch(&params, checkpoint.version()).await?;

        Ok(stream
            .map(|event| match event {
                Ok(event) => translate(event),
                Err(e) => Err(SyncError::from(e)),
            })
            .boxed())
    }
}

/// Why a stream session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Server closed the stream (watch timeout)
    StreamEnded,
    /// Checkpoint too old (HTTP 410)
    Expired,
    Error(String),
}

impl DisconnectReason {
    fn label(&self) -> &'static str {
        match self {
            DisconnectReason::StreamEnded => "stream_ended",
            DisconnectReason::Expired => "expired",
            DisconnectReason::Error(_) => "error",
        }
    }
}

impl From<SyncError> for DisconnectReason {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::WatchExpired(_) => DisconnectReason::Expired,
            other => DisconnectReason::Error(other.to_string()),
        }
    }
}

/// Connection state of a watch loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Reconnecting,
    Connected,
    Disconnected(DisconnectReason),
}

struct Session {
    reason: DisconnectReason,
    events: usize,
    elapsed: Duration,
}

/// Reconnecting watch loop for one resource kind
///
/// Events are applied one at a time: the loop waits for the store writer to
/// acknowledge each change before reading the next event.
pub struct WatchLoop<K, S, P> {
    source: S,
    policy: P,
    store: StoreHandle,
    checkpoint: WatchCheckpoint,
    backoff: Backoff,
    state: tokio::sync::watch::Sender<LinkState>,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S, P> WatchLoop<K, S, P>
where
    K: Resource + Send + 'static,
    S: ResourceWatch<K>,
    P: RoutePolicy<K>,
{
    pub fn new(source: S, policy: P, store: StoreHandle, backoff: &BackoffConfig) -> Self {
        Self {
            source,
            policy,
            store,
            checkpoint: WatchCheckpoint::default(),
            backoff: backoff.build(),
            state: tokio::sync::watch::Sender::new(LinkState::Reconnecting),
            _kind: PhantomData,
        }
    }

    /// Resume from a known position (the bootstrap listing)
    pub fn with_checkpoint(mut self, checkpoint: WatchCheckpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Follow the connection state of this loop
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LinkState) {
        set_watch_connected(self.policy.kind(), state == LinkState::Connected);
        self.state.send_replace(state);
    }

    /// Run until `shutdown` is cancelled or the store writer goes away.
    /// Returns the final checkpoint.
    pub async fn run(mut self, shutdown: CancellationToken) -> WatchCheckpoint {
        let kind = self.policy.kind();
        info!(kind, checkpoint = %self.checkpoint, "Starting watch loop");

        loop {
            self.set_state(LinkState::Reconnecting);

            let Some(session) = self.session(&shutdown).await else {
                break;
            };

            record_watch_reconnect(kind, session.reason.label());
            let delay = match &session.reason {
                DisconnectReason::StreamEnded
                    if session.events > 0 || session.elapsed >= MIN_HEALTHY_SESSION =>
                {
                    debug!(kind, events = session.events, "Watch stream ended, reopening");
                    None
                }
                DisconnectReason::StreamEnded => {
                    let delay = self.backoff.next_delay();
                    warn!(kind, delay = ?delay, "Watch stream closed immediately, backing off");
                    Some(delay)
                }
                DisconnectReason::Expired => {
                    warn!(
                        kind,
                        checkpoint = %self.checkpoint,
                        "Watch checkpoint expired, restarting from current state"
                    );
                    self.checkpoint.reset();
                    None
                }
                DisconnectReason::Error(message) => {
                    let delay = self.backoff.next_delay();
                    error!(
                        kind,
                        error = %message,
                        failures = self.backoff.failures(),
                        delay = ?delay,
                        "Watch stream failed, retrying"
                    );
                    Some(delay)
                }
            };
            self.set_state(LinkState::Disconnected(session.reason));

            if let Some(delay) = delay {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!(kind, checkpoint = %self.checkpoint, "Watch loop stopped");
        self.checkpoint
    }

    /// One stream from open to end. `None` means stop the loop.
    async fn session(&mut self, shutdown: &CancellationToken) -> Option<Session> {
        let started = Instant::now();

        let opened = tokio::select! {
            _ = shutdown.cancelled() => return None,
            opened = self.source.watch(&self.checkpoint) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                return Some(Session {
                    reason: e.into(),
                    events: 0,
                    elapsed: started.elapsed(),
                })
            }
        };

        self.set_state(LinkState::Connected);
        self.backoff.reset();
        debug!(kind = self.policy.kind(), checkpoint = %self.checkpoint, "Watch stream open");

        let mut events = 0;
        loop {
            // Shutdown is only observed between events; a change already
            // handed to the writer runs to completion.
            let next = tokio::select! {
                _ = shutdown.cancelled() => return None,
                next = stream.next() => next,
            };

            let reason = match next {
                Some(Ok(event)) => {
                    events += 1;
                    match self.handle(event).await {
                        Ok(()) => continue,
                        Err(SyncError::StoreClosed) => {
                            warn!(kind = self.policy.kind(), "Store writer closed, stopping watch");
                            return None;
                        }
                        Err(e) => {
                            error!(kind = self.policy.kind(), error = %e, "Failed to apply watch event");
                            continue;
                        }
                    }
                }
                Some(Err(e)) => DisconnectReason::from(e),
                None => DisconnectReason::StreamEnded,
            };

            return Some(Session {
                reason,
                events,
                elapsed: started.elapsed(),
            });
        }
    }

    async fn handle(&mut self, event: WatchEvent<K>) -> Result<()> {
        let kind = self.policy.kind();
        let label = event.label();

        let change = match event {
            WatchEvent::Bookmark(version) => {
                self.checkpoint.advance(version);
                record_watch_event(kind, label, "bookmark");
                return Ok(());
            }
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                self.observe(&obj);
                match self.policy.admit(&obj) {
                    Admission::Accepted(record) => RouteChange::Upsert(record),
                    Admission::Deferred { name, reason } => {
                        info!(
                            kind,
                            object = %object_key(&obj),
                            route = %name,
                            reason,
                            "Deferring route until an address is assigned"
                        );
                        record_watch_event(kind, label, "deferred");
                        return Ok(());
                    }
                    Admission::Rejected => {
                        record_watch_event(kind, label, "ignored");
                        return Ok(());
                    }
                }
            }
            WatchEvent::Deleted(obj) => {
                self.observe(&obj);
                if !self.policy.accepts(&obj) {
                    record_watch_event(kind, label, "ignored");
                    return Ok(());
                }
                match self.policy.route_name(&obj) {
                    Some(name) => RouteChange::Remove(name),
                    None => {
                        warn!(kind, object = %object_key(&obj), "Deleted resource has no route name");
                        record_watch_event(kind, label, "ignored");
                        return Ok(());
                    }
                }
            }
        };

        debug!(kind, event = label, change = %change, "Applying route change");
        let outcome = match self.store.apply(change).await? {
            WriteOutcome::Unchanged => "unchanged",
            WriteOutcome::Saved(_) => "applied",
            WriteOutcome::SaveFailed => "save_failed",
        };
        record_watch_event(kind, label, outcome);
        Ok(())
    }

    fn observe(&mut self, obj: &K) {
        if let Some(version) = obj.resource_version() {
            self.checkpoint.advance(version);
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(namespace) => format!("{}/{}", namespace, obj.name_any()),
        None => obj.name_any(),
    }
}
