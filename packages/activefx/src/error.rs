//! Structured error types for the activefx engine.
//!
//! `ActivefxError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. The boundary rule: `anyhow` is internal transport for
//! guard/action plumbing, `ActivefxError` is what crosses the public API.
//!
//! # Example
//!
//! ```ignore
//! use activefx::ActivefxError;
//!
//! match handle.dispatch(event) {
//!     Ok(()) => {}
//!     Err(ActivefxError::QueueFull { domain, capacity }) => {
//!         // Delivery is best-effort: the event was dropped. Retry or shed load.
//!         eprintln!("domain {domain} saturated at {capacity}");
//!     }
//!     Err(e) => eprintln!("dispatch failed: {e}"),
//! }
//! ```

use thiserror::Error;

/// Errors surfaced by domains, registries, and connections.
#[derive(Debug, Error)]
pub enum ActivefxError {
    /// The domain's bounded event queue is full. The event was dropped and a
    /// warning logged; delivery is at-most-once by contract.
    #[error("event queue full for domain '{domain}' (capacity {capacity}); event dropped")]
    QueueFull {
        /// Name of the saturated domain.
        domain: String,
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The domain is not accepting events (stopping or stopped).
    #[error("domain '{domain}' is not running")]
    NotRunning {
        /// Name of the domain.
        domain: String,
    },

    /// `start` was called on a domain with no initial state registered.
    #[error("domain '{domain}' has no initial state")]
    NoInitialState {
        /// Name of the domain.
        domain: String,
    },

    /// A domain with this name is already present in the registry.
    #[error("domain '{name}' is already registered")]
    DuplicateDomain {
        /// The conflicting name.
        name: String,
    },
}
