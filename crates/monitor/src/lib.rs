//! certwatch monitor core.
//!
//! Watches Kubernetes secrets and maintains a Prometheus gauge with the
//! hours-until-expiry of every X.509 certificate found in their data
//! fields, so operators can alert before certificates lapse.
//!
//! The pipeline: the [`kube`] informer keeps a local store current and
//! bridges change notifications into the deduplicating [`queue`]; the
//! [`controller`] worker pool drains it, running the [`scanner`] over each
//! secret's fields and reconciling the [`metrics`] registry so the exported
//! series always match what the secrets actually contain.

pub mod config;
pub mod controller;
pub mod kube;
pub mod metrics;
pub mod queue;
pub mod scanner;
pub mod server;

pub use config::MonitorConfig;
pub use controller::Controller;
pub use queue::{QueueEntry, WorkQueue};
