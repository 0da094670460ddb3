//! Reconciliation worker pool.
//!
//! A fixed set of workers drains the queue: look up the secret's current
//! state, scan its fields, and bring the published metric series in line
//! with what the scan found. Per-key serialization and redelivery are the
//! queue's job; this module only decides what one pass over one secret
//! means.

use std::collections::BTreeSet;
use std::sync::Arc;

use certwatch_common::{ChangeReason, SecretRef};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::kube::{SecretRecord, SecretStore};
use crate::metrics::{ControllerMetrics, ExpiryMetrics};
use crate::queue::{QueueEntry, WorkQueue};
use crate::scanner::{self, ScanOutcome};

/// Why one reconcile attempt failed. All variants are transient: the key
/// goes back through the rate-limited queue.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The secret was not in the local store; it may have vanished between
    /// notification and lookup, or the cache may be lagging
    #[error("secret {0} not found in local store")]
    NotFound(SecretRef),
}

/// Worker pool tying queue, store, scanner, and metrics together.
pub struct Controller {
    queue: Arc<WorkQueue>,
    store: Arc<dyn SecretStore>,
    expiry: Arc<ExpiryMetrics>,
    metrics: Arc<ControllerMetrics>,
}

impl Controller {
    /// Assemble a controller over an already-wired queue and store.
    pub fn new(
        queue: Arc<WorkQueue>,
        store: Arc<dyn SecretStore>,
        expiry: Arc<ExpiryMetrics>,
        metrics: Arc<ControllerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            store,
            expiry,
            metrics,
        })
    }

    /// Run `workers` parallel workers until `shutdown` flips to `true`,
    /// then stop queue dispatch and wait for the workers to exit. In-flight
    /// scans finish; queued keys are abandoned.
    pub async fn run(self: Arc<Self>, workers: usize, mut shutdown: watch::Receiver<bool>) {
        info!(workers, "starting reconciliation workers");

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let controller = Arc::clone(&self);
            handles.push(tokio::spawn(controller.worker_loop(worker)));
        }

        let _ = shutdown.wait_for(|stop| *stop).await;
        self.queue.shut_down();

        for handle in handles {
            let _ = handle.await;
        }
        info!("reconciliation workers stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker started");

        while let Some(entry) = self.queue.get().await {
            self.metrics.set_queue_depth(self.queue.len());

            match self.reconcile(&entry) {
                Ok(()) => {
                    self.metrics.observe_reconcile("ok");
                    self.queue.forget(&entry.key);
                    self.queue.done(&entry.key);
                }
                Err(err) => {
                    self.metrics.observe_reconcile("error");
                    warn!(worker, key = %entry.key, error = %err, "reconcile failed, requeueing");
                    // Done before the rate-limited re-add so the key is
                    // eligible for its next attempt; the backoff timer
                    // governs when that attempt happens.
                    self.queue.done(&entry.key);
                    self.queue.add_rate_limited(entry.key.clone(), entry.reason);
                }
            }
        }

        debug!(worker, "worker exiting");
    }

    /// One pass over one secret.
    pub fn reconcile(&self, entry: &QueueEntry) -> Result<(), ReconcileError> {
        if entry.reason == ChangeReason::Deleted {
            // The data is gone; all that is left to do is retire its series.
            debug!(key = %entry.key, "secret deleted, removing its metric series");
            self.expiry.remove_all(&entry.key);
            return Ok(());
        }

        let record = self
            .store
            .get(&entry.key)
            .ok_or_else(|| ReconcileError::NotFound(entry.key.clone()))?;

        self.scan_record(&entry.key, &record);
        Ok(())
    }

    /// Scan every field and diff the result against the published series.
    fn scan_record(&self, key: &SecretRef, record: &SecretRecord) {
        let previous = self.expiry.published_fields(key);
        let mut current = BTreeSet::new();

        for (field, value) in &record.data {
            match scanner::scan(value) {
                ScanOutcome::Expiry(expires_in) => {
                    let hours = expires_in.as_seconds_f64() / 3600.0;
                    debug!(key = %key, field = %field, hours, "publishing certificate expiry");
                    self.expiry.set_expiry(key, field, expires_in);
                    current.insert(field.clone());
                }
                ScanOutcome::NotACertificate => {
                    debug!(key = %key, field = %field, "field does not contain a certificate");
                }
                ScanOutcome::Malformed(err) => {
                    // Reported but non-fatal: one broken field must not
                    // block the rest of the secret or retry forever.
                    error!(key = %key, field = %field, error = %err, "malformed certificate material, skipping field");
                }
            }
        }

        for field in previous.difference(&current) {
            debug!(key = %key, field = %field, "retiring stale expiry series");
            self.expiry.remove_field(key, field);
        }
    }
}
