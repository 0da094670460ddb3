//! Shared building blocks for the certwatch monitor.
//!
//! This crate holds the types that cross component boundaries (secret
//! identities, change reasons) and the tracing bootstrap, so the monitor
//! crate and its tests bind to a single small dependency surface.

pub mod observability;
pub mod types;

pub use types::{ChangeReason, SecretRef, SecretRefParseError};
