//! Armada - multi-cluster Kubernetes connection pool with graceful degradation
//!
//! Armada keeps a client application connected to any number of
//! independently reachable clusters at once, each with its own credential
//! lifecycle, and exposes them as one coherent, queryable surface. Each
//! cluster connection can fail, expire credentials, or be rebuilt at any
//! time without affecting the others, and a query spanning several
//! clusters still returns a usable partial result when some of them are
//! broken.
//!
//! # Architecture
//!
//! Four tightly coupled pieces form the core:
//!
//! - a per-cluster auth state machine with backoff-scheduled recovery
//! - a per-key operation coordinator that guarantees at most one in-flight
//!   lifecycle operation per cluster and cancels superseded ones
//! - a pool reconciler that converges live connections to a desired
//!   selection set with bounded parallelism and fail-atomic batches
//! - an aggregator that fans one logical query out to every selected
//!   cluster and merges the results, tolerating partial failure
//!
//! # Modules
//!
//! - [`auth`] - Per-cluster auth state machine and 401 transport interception
//! - [`coordinator`] - Superseding per-key operation coordination
//! - [`pool`] - Cluster connection pool and reconciler
//! - [`aggregate`] - Multi-cluster query fan-out and merging
//! - [`factory`] - Connection construction (kubeconfig → client stack)
//! - [`selection`] - Cluster selections, stable IDs, and metadata
//! - [`diagnostics`] - Per-cluster and pool-wide auth snapshots
//! - [`telemetry`] - Retry and transport telemetry sinks
//! - [`error`] - Error types and failure classification

#![deny(missing_docs)]

pub mod aggregate;
pub mod auth;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod factory;
pub mod pool;
pub mod selection;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default hard ceiling for a single cluster build/rebuild operation.
///
/// Independent of supersession: a wedged remote call cannot block a
/// cluster's operation slot past this bound.
pub const DEFAULT_OPERATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Default number of credential recovery attempts per failure episode
pub const DEFAULT_RECOVERY_ATTEMPTS: u32 = 3;
