//! Kubernetes integration.
//!
//! Everything that talks to the cluster lives here: resolving connection
//! configuration ([`config`]), the typed secrets API client ([`client`]),
//! and the list/watch informer ([`informer`]) that keeps a local store of
//! secret data and bridges change notifications into the work queue.

pub mod client;
pub mod config;
pub mod informer;

pub use client::{KubeClientError, SecretClient, SecretRecord, WatchEvent};
pub use config::{KubeAuth, KubeConfigError, ResolvedKubeConfig};
pub use informer::{SecretInformer, SecretStore, SharedStore};
