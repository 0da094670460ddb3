//! Runtime configuration for the monitor process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Everything the monitor needs to run, assembled from CLI flags and
/// environment in `main`.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Kubeconfig path; `None` means in-cluster with a kubeconfig fallback
    pub kubeconfig: Option<PathBuf>,
    /// Listen address for `/metrics` and the health probes
    pub listen: SocketAddr,
    /// Restrict watching to one namespace; `None` watches cluster-wide
    pub namespace: Option<String>,
    /// Number of parallel reconciliation workers
    pub workers: usize,
    /// Interval between full re-deliveries of the cached secrets
    pub resync_interval: Duration,
    /// Prefix for exported metric names
    pub metrics_prefix: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            listen: "0.0.0.0:3000".parse().expect("static listen address"),
            namespace: None,
            workers: 2,
            resync_interval: Duration::from_secs(30),
            metrics_prefix: "certwatch".to_string(),
        }
    }
}
