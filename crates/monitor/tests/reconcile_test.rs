//! End-to-end reconciliation tests over an in-memory secret store.
//!
//! These exercise the controller the way the informer-fed production wiring
//! does, but with a fake store so secret state can be mutated directly
//! between passes.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use certwatch_common::{ChangeReason, SecretRef};
use certwatch_monitor::controller::{Controller, ReconcileError};
use certwatch_monitor::kube::{SecretRecord, SecretStore};
use certwatch_monitor::metrics::{ControllerMetrics, ExpiryMetrics};
use certwatch_monitor::queue::{QueueEntry, WorkQueue};
use certwatch_monitor::scanner::{self, ScanOutcome};
use parking_lot::Mutex;
use prometheus::Registry;
use tokio::sync::watch;

const VALID_PEM: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/valid.pem"));
const EXPIRED_PEM: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/expired.pem"));

/// Mutable in-memory store that also counts lookups.
#[derive(Default)]
struct FakeStore {
    secrets: Mutex<HashMap<SecretRef, SecretRecord>>,
    lookups: AtomicUsize,
}

impl FakeStore {
    fn insert(&self, key: SecretRef, data: &[(&str, &[u8])]) {
        let record = SecretRecord {
            data: data
                .iter()
                .map(|(field, value)| (field.to_string(), value.to_vec()))
                .collect(),
        };
        self.secrets.lock().insert(key, record);
    }

    fn remove(&self, key: &SecretRef) {
        self.secrets.lock().remove(key);
    }

    fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl SecretStore for FakeStore {
    fn get(&self, key: &SecretRef) -> Option<SecretRecord> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.secrets.lock().get(key).cloned()
    }
}

struct Harness {
    registry: Registry,
    store: Arc<FakeStore>,
    expiry: Arc<ExpiryMetrics>,
    queue: Arc<WorkQueue>,
    controller: Arc<Controller>,
}

fn harness() -> Harness {
    let registry = Registry::new();
    let expiry = Arc::new(ExpiryMetrics::register("certwatch", &registry).unwrap());
    let metrics = Arc::new(ControllerMetrics::register("certwatch", &registry).unwrap());
    let store = Arc::new(FakeStore::default());
    let queue = WorkQueue::with_backoff(Duration::from_millis(10), Duration::from_secs(1));
    let controller = Controller::new(
        Arc::clone(&queue),
        Arc::clone(&store) as Arc<dyn SecretStore>,
        Arc::clone(&expiry),
        metrics,
    );

    Harness {
        registry,
        store,
        expiry,
        queue,
        controller,
    }
}

fn alpha() -> SecretRef {
    SecretRef::new("ns", "alpha")
}

fn entry(reason: ChangeReason) -> QueueEntry {
    QueueEntry {
        key: alpha(),
        reason,
    }
}

/// Published series for the expiry gauge as `(field, hours)` pairs.
fn gauge_series(registry: &Registry) -> HashMap<String, f64> {
    registry
        .gather()
        .into_iter()
        .filter(|family| family.get_name() == "certwatch_expires_in_hours")
        .flat_map(|family| family.get_metric().to_vec())
        .map(|metric| {
            let field = metric
                .get_label()
                .iter()
                .find(|pair| pair.get_name() == "field")
                .map(|pair| pair.get_value().to_string())
                .unwrap_or_default();
            (field, metric.get_gauge().get_value())
        })
        .collect()
}

fn counter_value(registry: &Registry, name: &str, result: &str) -> u64 {
    registry
        .gather()
        .into_iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric().to_vec())
        .find(|metric| {
            metric
                .get_label()
                .iter()
                .any(|pair| pair.get_name() == "result" && pair.get_value() == result)
        })
        .map(|metric| metric.get_counter().get_value() as u64)
        .unwrap_or(0)
}

#[test]
fn added_secret_publishes_only_certificate_fields() {
    let h = harness();
    h.store.insert(
        alpha(),
        &[
            ("tls.crt", VALID_PEM.as_bytes()),
            ("note", b"hello".as_slice()),
        ],
    );

    h.controller.reconcile(&entry(ChangeReason::Added)).unwrap();

    assert_eq!(
        h.expiry.published_fields(&alpha()),
        BTreeSet::from(["tls.crt".to_string()])
    );

    // The gauge must agree with what the scanner itself reports for the
    // fixture, so the assertion does not depend on the wall clock.
    let expected_hours = match scanner::scan(VALID_PEM.as_bytes()) {
        ScanOutcome::Expiry(d) => d.as_seconds_f64() / 3600.0,
        other => panic!("fixture did not scan as a certificate: {other:?}"),
    };
    let series = gauge_series(&h.registry);
    assert_eq!(series.len(), 1);
    assert!((series["tls.crt"] - expected_hours).abs() < 0.1);
}

#[test]
fn rotating_the_certificate_out_retires_its_series() {
    let h = harness();
    h.store
        .insert(alpha(), &[("tls.crt", VALID_PEM.as_bytes())]);
    h.controller.reconcile(&entry(ChangeReason::Added)).unwrap();
    assert_eq!(gauge_series(&h.registry).len(), 1);

    // The certificate is replaced with something that is not one.
    h.store
        .insert(alpha(), &[("tls.crt", b"rotated away".as_slice())]);
    h.controller
        .reconcile(&entry(ChangeReason::Updated))
        .unwrap();

    assert!(h.expiry.published_fields(&alpha()).is_empty());
    assert!(gauge_series(&h.registry).is_empty());
}

#[test]
fn expired_certificate_stays_published_with_negative_hours() {
    let h = harness();
    h.store
        .insert(alpha(), &[("tls.crt", VALID_PEM.as_bytes())]);
    h.controller.reconcile(&entry(ChangeReason::Added)).unwrap();

    h.store
        .insert(alpha(), &[("tls.crt", EXPIRED_PEM.as_bytes())]);
    h.controller
        .reconcile(&entry(ChangeReason::Updated))
        .unwrap();

    // Still published: a negative value is exactly what alerting needs.
    let series = gauge_series(&h.registry);
    assert_eq!(series.len(), 1);
    assert!(series["tls.crt"] < 0.0, "hours: {}", series["tls.crt"]);
    assert_eq!(
        h.expiry.published_fields(&alpha()),
        BTreeSet::from(["tls.crt".to_string()])
    );
}

#[test]
fn deleting_a_secret_removes_every_series_without_a_lookup() {
    let h = harness();
    h.store.insert(
        alpha(),
        &[
            ("tls.crt", VALID_PEM.as_bytes()),
            ("ca.crt", VALID_PEM.as_bytes()),
        ],
    );
    h.controller.reconcile(&entry(ChangeReason::Added)).unwrap();
    assert_eq!(gauge_series(&h.registry).len(), 2);
    let lookups_before = h.store.lookup_count();

    h.store.remove(&alpha());
    h.controller
        .reconcile(&entry(ChangeReason::Deleted))
        .unwrap();

    assert!(gauge_series(&h.registry).is_empty());
    assert!(h.expiry.published_fields(&alpha()).is_empty());
    assert_eq!(
        h.store.lookup_count(),
        lookups_before,
        "delete pass must not consult the store"
    );
}

#[test]
fn malformed_field_does_not_block_the_valid_one() {
    let h = harness();
    let bogus = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
    h.store.insert(
        alpha(),
        &[
            ("tls.crt", VALID_PEM.as_bytes()),
            ("broken.crt", bogus.as_slice()),
        ],
    );

    // The pass as a whole succeeds: a malformed field is reported and
    // skipped, never retried forever.
    h.controller.reconcile(&entry(ChangeReason::Added)).unwrap();

    assert_eq!(
        h.expiry.published_fields(&alpha()),
        BTreeSet::from(["tls.crt".to_string()])
    );
}

#[test]
fn missing_secret_is_a_transient_error() {
    let h = harness();

    let err = h
        .controller
        .reconcile(&entry(ChangeReason::Updated))
        .unwrap_err();
    assert!(matches!(err, ReconcileError::NotFound(_)));
    assert!(gauge_series(&h.registry).is_empty());
}

#[tokio::test(start_paused = true)]
async fn worker_retries_missing_secret_until_it_appears() {
    let h = harness();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = tokio::spawn(Arc::clone(&h.controller).run(1, shutdown_rx));

    // Not in the store yet: the first attempts fail and requeue with
    // backoff.
    h.queue.add(alpha(), ChangeReason::Added);

    let registry = h.registry.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter_value(&registry, "certwatch_reconciles_total", "error") < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("expected at least two failed attempts");

    // The secret shows up; the next retry succeeds.
    h.store
        .insert(alpha(), &[("tls.crt", VALID_PEM.as_bytes())]);

    let registry = h.registry.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter_value(&registry, "certwatch_reconciles_total", "ok") < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("expected a successful attempt");

    assert_eq!(gauge_series(&h.registry).len(), 1);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn workers_drain_distinct_keys() {
    let h = harness();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for name in ["alpha", "beta", "gamma"] {
        h.store.insert(
            SecretRef::new("ns", name),
            &[("tls.crt", VALID_PEM.as_bytes())],
        );
        h.queue.add(SecretRef::new("ns", name), ChangeReason::Added);
    }

    let run = tokio::spawn(Arc::clone(&h.controller).run(2, shutdown_rx));

    let registry = h.registry.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter_value(&registry, "certwatch_reconciles_total", "ok") < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("expected all three secrets reconciled");

    assert_eq!(gauge_series(&h.registry).len(), 3);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap();
}
