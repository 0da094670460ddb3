//! List/watch informer with a local read-through store.
//!
//! The informer keeps an in-memory copy of every visible secret current by
//! listing once and then following a watch, and bridges each change into an
//! event handler (the work queue, in production wiring). Workers never talk
//! to the API server directly; they read the store, which is eventually
//! consistent with the cluster.
//!
//! Readiness: the store is unusable until the first list has been applied,
//! so consumers must await [`SecretInformer::synced`] before starting
//! workers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use certwatch_common::{ChangeReason, SecretRef};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::client::{KubeClientError, SecretClient, SecretRecord, WatchEvent};

/// Pause between a failed or exhausted watch and the next list attempt.
const RELIST_DELAY: Duration = Duration::from_secs(5);

/// Read-through lookup of current secret state.
///
/// The seam between the informer and the reconciliation core; tests
/// substitute an in-memory fake.
pub trait SecretStore: Send + Sync {
    /// Current record for `key`, if the store has seen it.
    fn get(&self, key: &SecretRef) -> Option<SecretRecord>;
}

/// Shared handle to the informer's local store.
#[derive(Clone, Default)]
pub struct SharedStore {
    inner: Arc<RwLock<HashMap<SecretRef, SecretRecord>>>,
}

impl SecretStore for SharedStore {
    fn get(&self, key: &SecretRef) -> Option<SecretRecord> {
        self.inner.read().get(key).cloned()
    }
}

impl SharedStore {
    fn keys(&self) -> Vec<SecretRef> {
        self.inner.read().keys().cloned().collect()
    }
}

/// Receives `(key, reason)` change notifications from the informer.
pub type EventHandler = Arc<dyn Fn(SecretRef, ChangeReason) + Send + Sync>;

/// Maintains the local secret store from a list/watch loop and delivers
/// change notifications to the handler.
pub struct SecretInformer {
    client: SecretClient,
    store: SharedStore,
    handler: EventHandler,
    resync_interval: Duration,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
}

impl SecretInformer {
    /// Create an informer feeding `handler`.
    ///
    /// Every `resync_interval` all cached keys are re-delivered as
    /// `Updated`, so a missed or mis-handled notification heals on its own.
    pub fn new(client: SecretClient, resync_interval: Duration, handler: EventHandler) -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        Self {
            client,
            store: SharedStore::default(),
            handler,
            resync_interval,
            synced_tx,
            synced_rx,
        }
    }

    /// Handle to the local store for read-through lookups.
    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Receiver that flips to `true` once the first list has been applied.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    /// Run the list/watch loop until `shutdown` flips to `true`.
    ///
    /// Each iteration lists (replacing the store and reconciling
    /// differences into events), then consumes the watch until it ends or
    /// fails, then starts over after a short delay.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("starting secret informer");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.sync_and_watch(&mut shutdown).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    debug!("watch ended, re-listing");
                }
                Err(err) => {
                    warn!(error = %err, "list/watch failed, re-listing after delay");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RELIST_DELAY) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("secret informer stopped");
    }

    async fn sync_and_watch(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), KubeClientError> {
        let (items, mut resource_version) = self.client.list().await?;
        self.replace_store(items);
        self.synced_tx.send_replace(true);

        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + self.resync_interval,
            self.resync_interval,
        );

        let stream = self.client.watch(resource_version.as_deref()).await?;
        let mut stream = std::pin::pin!(stream);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = resync.tick() => self.resync(),
                event = stream.next() => match event {
                    None => return Ok(()),
                    Some(Err(KubeClientError::Decode(err))) => {
                        // Wrong or corrupt object on the stream: drop the
                        // single event, keep the watch.
                        warn!(error = %err, "dropping undecodable watch event");
                    }
                    Some(Err(err)) => return Err(err),
                    Some(Ok(event)) => self.apply(event, &mut resource_version),
                },
            }
        }
    }

    /// Replace the store with a fresh list, emitting the events the diff
    /// implies: `Added`/`Updated` for everything present, `Deleted` for
    /// everything that disappeared while the watch was down.
    fn replace_store(&self, items: Vec<(SecretRef, SecretRecord)>) {
        let mut events = Vec::with_capacity(items.len());
        {
            let mut store = self.store.inner.write();
            let mut stale: HashSet<SecretRef> = store.keys().cloned().collect();

            for (key, record) in items {
                let reason = if stale.remove(&key) {
                    ChangeReason::Updated
                } else {
                    ChangeReason::Added
                };
                store.insert(key.clone(), record);
                events.push((key, reason));
            }

            for key in stale {
                store.remove(&key);
                events.push((key, ChangeReason::Deleted));
            }
        }

        debug!(count = events.len(), "applied list to store");
        for (key, reason) in events {
            (self.handler)(key, reason);
        }
    }

    /// Re-deliver every cached key as `Updated`.
    fn resync(&self) {
        let keys = self.store.keys();
        debug!(count = keys.len(), "resyncing cached secrets");
        for key in keys {
            (self.handler)(key, ChangeReason::Updated);
        }
    }

    /// Apply one watch event to the store and forward it to the handler.
    fn apply(&self, event: WatchEvent, resource_version: &mut Option<String>) {
        match event {
            WatchEvent::Added {
                key,
                record,
                resource_version: rv,
            } => {
                if rv.is_some() {
                    *resource_version = rv;
                }
                self.store.inner.write().insert(key.clone(), record);
                (self.handler)(key, ChangeReason::Added);
            }
            WatchEvent::Modified {
                key,
                record,
                resource_version: rv,
            } => {
                if rv.is_some() {
                    *resource_version = rv;
                }
                self.store.inner.write().insert(key.clone(), record);
                (self.handler)(key, ChangeReason::Updated);
            }
            WatchEvent::Deleted {
                key,
                resource_version: rv,
            } => {
                if rv.is_some() {
                    *resource_version = rv;
                }
                self.store.inner.write().remove(&key);
                (self.handler)(key, ChangeReason::Deleted);
            }
            WatchEvent::Bookmark {
                resource_version: rv,
            } => {
                *resource_version = Some(rv);
            }
        }
    }
}
