//! Retry and transport telemetry
//!
//! The core reports recovery retry attempts, retry exhaustion, and
//! per-cluster transport outcomes to an injected [`TelemetrySink`]. This is
//! observability, not a control dependency: nothing in the pool or the auth
//! state machine reads these counters to make decisions.
//!
//! [`ConnectivityStats`] is the separate, lighter transport-failure tracker:
//! network blips land here and never touch auth state.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::selection::ClusterId;

/// Sink for retry and transport telemetry events
#[cfg_attr(test, automock)]
pub trait TelemetrySink: Send + Sync {
    /// A recovery probe attempt failed and will be retried
    fn retry_attempt(&self, cluster: &ClusterId, attempt: u32, reason: &str);

    /// Recovery gave up after exhausting its attempts
    fn retry_exhausted(&self, cluster: &ClusterId, attempts: u32);

    /// One transport-level call finished (pre-flight probe or recovery probe)
    fn transport_result(&self, cluster: &ClusterId, succeeded: bool);
}

/// Default sink that logs events through `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn retry_attempt(&self, cluster: &ClusterId, attempt: u32, reason: &str) {
        warn!(cluster = %cluster, attempt, reason, "Recovery attempt failed, retrying");
    }

    fn retry_exhausted(&self, cluster: &ClusterId, attempts: u32) {
        warn!(cluster = %cluster, attempts, "Recovery exhausted all attempts");
    }

    fn transport_result(&self, cluster: &ClusterId, succeeded: bool) {
        debug!(cluster = %cluster, succeeded, "Transport call finished");
    }
}

/// Per-cluster transport success/failure counts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportCounts {
    /// Calls that reached the endpoint and came back usable
    pub successes: u64,
    /// Calls that failed for network reasons
    pub failures: u64,
}

/// Counting sink: keeps per-cluster transport counts readable by
/// diagnostics while still logging retries through `tracing`.
#[derive(Debug, Default)]
pub struct ConnectivityStats {
    counts: DashMap<ClusterId, TransportCounts>,
}

impl ConnectivityStats {
    /// Create an empty stats sink
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current counts for one cluster (zeros if never seen)
    pub fn counts(&self, cluster: &ClusterId) -> TransportCounts {
        self.counts
            .get(cluster)
            .map(|c| *c.value())
            .unwrap_or_default()
    }

    /// Drop the counters for a cluster that left the pool
    pub fn forget(&self, cluster: &ClusterId) {
        self.counts.remove(cluster);
    }
}

impl TelemetrySink for ConnectivityStats {
    fn retry_attempt(&self, cluster: &ClusterId, attempt: u32, reason: &str) {
        warn!(cluster = %cluster, attempt, reason, "Recovery attempt failed, retrying");
    }

    fn retry_exhausted(&self, cluster: &ClusterId, attempts: u32) {
        warn!(cluster = %cluster, attempts, "Recovery exhausted all attempts");
    }

    fn transport_result(&self, cluster: &ClusterId, succeeded: bool) {
        let mut entry = self.counts.entry(cluster.clone()).or_default();
        if succeeded {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }
}
