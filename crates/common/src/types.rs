//! Common type definitions for the certwatch monitor.
//!
//! The identity type here, [`SecretRef`], is the unit of deduplication in
//! the work queue and the primary key of the metrics registry, so it is kept
//! small, hashable, and cheap to clone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a Kubernetes secret: namespace plus name.
///
/// Renders as `namespace/name`, the same composite key the API server uses
/// for namespaced objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretRef {
    /// Namespace the secret lives in
    pub namespace: String,
    /// Secret name within the namespace
    pub name: String,
}

impl SecretRef {
    /// Create a reference from namespace and name parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Error parsing a `namespace/name` composite key.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid secret reference {input:?}, expected namespace/name")]
pub struct SecretRefParseError {
    /// The rejected input
    pub input: String,
}

impl FromStr for SecretRef {
    type Err = SecretRefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(SecretRefParseError {
                input: s.to_string(),
            }),
        }
    }
}

/// Why a secret was enqueued for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeReason {
    /// Secret appeared (initial list or watch ADDED)
    Added,
    /// Secret data changed (watch MODIFIED, or periodic resync)
    Updated,
    /// Secret was removed; its data can no longer be read
    Deleted,
}

impl ChangeReason {
    /// Stable lowercase label, used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_ref_display_round_trips() {
        let r = SecretRef::new("kube-system", "ingress-tls");
        let parsed: SecretRef = r.to_string().parse().unwrap();
        assert_eq!(parsed, r);
    }

    #[test]
    fn secret_ref_rejects_malformed_keys() {
        for input in ["", "no-slash", "/name", "ns/", "a/b/c"] {
            assert!(input.parse::<SecretRef>().is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn change_reason_labels_are_lowercase() {
        assert_eq!(ChangeReason::Added.to_string(), "added");
        assert_eq!(ChangeReason::Deleted.as_str(), "deleted");
    }
}
