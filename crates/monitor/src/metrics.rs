//! Prometheus metrics for the monitor.
//!
//! [`ExpiryMetrics`] owns the per-certificate expiry gauge together with the
//! side index of which series are currently published for each secret. The
//! index exists because a gauge vec cannot enumerate its own label sets per
//! secret: without it, a deleted or rotated certificate would leave a stale,
//! never-updated series in the scrape output. The index is authoritative;
//! the gauge is treated purely as a write target.

use std::collections::{BTreeSet, HashMap};

use certwatch_common::SecretRef;
use parking_lot::RwLock;
use prometheus::{GaugeVec, IntCounterVec, IntGauge, Opts, Registry};
use time::Duration;
use tracing::debug;

/// Expiry gauge plus the authoritative index of published series.
pub struct ExpiryMetrics {
    expires_in: GaugeVec,
    published: RwLock<HashMap<SecretRef, BTreeSet<String>>>,
}

impl ExpiryMetrics {
    /// Create the gauge under `<prefix>_expires_in_hours` and register it
    /// with the given registry.
    pub fn register(prefix: &str, registry: &Registry) -> Result<Self, prometheus::Error> {
        let expires_in = GaugeVec::new(
            Opts::new(
                "expires_in_hours",
                "Hours until the certificate in a secret data field expires (negative once expired)",
            )
            .namespace(prefix),
            &["namespace", "name", "field"],
        )?;
        registry.register(Box::new(expires_in.clone()))?;

        Ok(Self {
            expires_in,
            published: RwLock::new(HashMap::new()),
        })
    }

    /// Publish or update the expiry series for one secret field.
    /// Idempotent; the value is signed hours until `notAfter`.
    pub fn set_expiry(&self, key: &SecretRef, field: &str, expires_in: Duration) {
        self.expires_in
            .with_label_values(&[key.namespace.as_str(), key.name.as_str(), field])
            .set(expires_in.as_seconds_f64() / 3600.0);

        self.published
            .write()
            .entry(key.clone())
            .or_default()
            .insert(field.to_string());
    }

    /// Delete the series for one secret field and drop it from the index.
    pub fn remove_field(&self, key: &SecretRef, field: &str) {
        if self
            .expires_in
            .remove_label_values(&[key.namespace.as_str(), key.name.as_str(), field])
            .is_err()
        {
            debug!(key = %key, field, "no published series to remove");
        }

        let mut published = self.published.write();
        if let Some(fields) = published.get_mut(key) {
            fields.remove(field);
            if fields.is_empty() {
                published.remove(key);
            }
        }
    }

    /// Delete every series published for the secret and clear its index
    /// entry. Used when the secret itself is deleted and its fields can no
    /// longer be read.
    pub fn remove_all(&self, key: &SecretRef) {
        let fields = { self.published.write().remove(key) };

        for field in fields.unwrap_or_default() {
            if self
                .expires_in
                .remove_label_values(&[key.namespace.as_str(), key.name.as_str(), &field])
                .is_err()
            {
                debug!(key = %key, field = %field, "indexed series missing from gauge");
            }
        }
    }

    /// Snapshot of the fields that currently have a published series for
    /// the secret. The reconcile pass diffs against this to decide which
    /// series to retire.
    pub fn published_fields(&self, key: &SecretRef) -> BTreeSet<String> {
        self.published.read().get(key).cloned().unwrap_or_default()
    }
}

/// Operational counters for the reconciliation loop itself.
pub struct ControllerMetrics {
    reconciles: IntCounterVec,
    queue_depth: IntGauge,
}

impl ControllerMetrics {
    /// Register reconcile/queue metrics under the same prefix as the expiry
    /// gauge.
    pub fn register(prefix: &str, registry: &Registry) -> Result<Self, prometheus::Error> {
        let reconciles = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconciliation passes by result").namespace(prefix),
            &["result"],
        )?;
        registry.register(Box::new(reconciles.clone()))?;

        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Keys waiting in the work queue").namespace(prefix),
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            reconciles,
            queue_depth,
        })
    }

    /// Count one completed reconcile pass.
    pub fn observe_reconcile(&self, result: &str) {
        self.reconciles.with_label_values(&[result]).inc();
    }

    /// Record the current number of queued keys.
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }
}
