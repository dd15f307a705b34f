//! Cluster connection pool and reconciler
//!
//! The pool owns one [`ClusterEntry`] per live cluster ID, guarded by a
//! single lock that is never held across network I/O. [`ClusterPool::reconcile`]
//! converges the pool to a desired selection set: missing connections are
//! built through the operation coordinator with bounded parallelism,
//! entries no longer desired are torn down, and a partial build failure
//! rolls the whole batch back so readers never observe a half-applied
//! pool.
//!
//! Entries are read-mostly after construction and never mutated in place:
//! a "change" to a cluster's connection is build-a-new-entry-then-swap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::transport::AuthInterceptLayer;
use crate::auth::{AuthCallbacks, AuthConfig, AuthMonitor};
use crate::coordinator::{OperationCoordinator, OperationKey};
use crate::error::FailureKind;
use crate::factory::{ClusterHandles, ConnectionFactory};
use crate::selection::{ClusterId, ClusterMeta, ClusterSelection};
use crate::telemetry::TelemetrySink;
use crate::{Error, Result};

/// Pool-wide configuration
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Hard ceiling for any single build/rebuild operation
    pub operation_timeout: Duration,
    /// Upper bound on concurrent builds in one reconcile pass
    pub max_build_parallelism: usize,
    /// Auth recovery configuration applied to every new monitor
    pub auth: AuthConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            operation_timeout: crate::DEFAULT_OPERATION_TIMEOUT,
            max_build_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            auth: AuthConfig::default(),
        }
    }
}

/// Live, constructed connection state for one cluster.
///
/// Created by the reconciler when its selection enters the desired set and
/// destroyed (monitor shut down first) when it leaves. Immutable once
/// installed.
pub struct ClusterEntry {
    /// Stable identity
    pub meta: ClusterMeta,
    /// The selection this entry was built from
    pub selection: ClusterSelection,
    /// Client handles and collaborator services
    pub handles: ClusterHandles,
    /// This cluster's auth state machine
    pub auth: Arc<AuthMonitor>,
    /// The pre-flight probe failed with a credential error at build time.
    /// Not a construction failure: the entry waits in the pool for
    /// recovery.
    pub auth_failed_on_init: bool,
}

/// What one reconcile pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Entries built and installed
    pub built: usize,
    /// Stale entries torn down
    pub removed: usize,
    /// A newer reconcile superseded this one; the pool was left unchanged
    pub superseded: bool,
}

/// Connection pool keyed by cluster ID
pub struct ClusterPool {
    entries: Mutex<HashMap<ClusterId, Arc<ClusterEntry>>>,
    coordinator: OperationCoordinator,
    factory: Arc<dyn ConnectionFactory>,
    telemetry: Arc<dyn TelemetrySink>,
    config: PoolConfig,
    root: CancellationToken,
}

impl ClusterPool {
    /// Create an empty pool
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        telemetry: Arc<dyn TelemetrySink>,
        config: PoolConfig,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            coordinator: OperationCoordinator::new(config.operation_timeout),
            factory,
            telemetry,
            config,
            root: CancellationToken::new(),
        }
    }

    /// The entry for a cluster, if it is live
    pub fn get(&self, id: &ClusterId) -> Option<Arc<ClusterEntry>> {
        self.entries
            .lock()
            .expect("pool lock poisoned")
            .get(id)
            .cloned()
    }

    /// Sorted IDs of all live clusters
    pub fn ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self
            .entries
            .lock()
            .expect("pool lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of all live entries
    pub fn entries(&self) -> Vec<Arc<ClusterEntry>> {
        self.entries
            .lock()
            .expect("pool lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Number of live clusters
    pub fn len(&self) -> usize {
        self.entries.lock().expect("pool lock poisoned").len()
    }

    /// True when no clusters are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down every entry, shutting down each auth monitor
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("pool lock poisoned");
        for (id, entry) in entries.drain() {
            entry.auth.shutdown();
            debug!(cluster = %id, "Cluster torn down");
        }
    }

    /// Cancel all in-flight operations and tear down the pool
    pub fn shutdown(&self) {
        self.root.cancel();
        self.clear();
    }

    /// Converge the pool to `desired`, touching only what changed.
    ///
    /// Fail-atomic: a hard construction error for any cluster aborts the
    /// pass, shuts down every monitor created during it, and leaves the
    /// pool exactly as it was. Calling twice with the same desired set is
    /// idempotent.
    #[instrument(skip_all, fields(desired = desired.len()))]
    pub async fn reconcile(&self, desired: &[ClusterSelection]) -> Result<ReconcileSummary> {
        let mut desired_map: HashMap<ClusterId, ClusterSelection> = HashMap::new();
        for selection in desired {
            let Some(id) = selection.cluster_id() else {
                warn!(
                    selection = %selection.describe(),
                    "Dropping selection with unresolvable cluster identity"
                );
                continue;
            };
            if desired_map.insert(id, selection.clone()).is_some() {
                return Err(Error::DuplicateSelection(selection.describe()));
            }
        }

        // Diff under the lock, then release it before any network I/O
        let to_create: Vec<(ClusterId, ClusterSelection)> = {
            let entries = self.entries.lock().expect("pool lock poisoned");
            desired_map
                .iter()
                .filter(|(id, _)| !entries.contains_key(*id))
                .map(|(id, sel)| (id.clone(), sel.clone()))
                .collect()
        };

        let parallelism = to_create.len().min(self.config.max_build_parallelism).max(1);
        let outcomes: Vec<Result<Option<Arc<ClusterEntry>>>> = stream::iter(
            to_create
                .into_iter()
                .map(|(id, selection)| self.build_entry(id, selection)),
        )
        .buffer_unordered(parallelism)
        .collect()
        .await;

        let mut built = Vec::new();
        let mut superseded = false;
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(Some(entry)) => built.push(entry),
                Ok(None) => superseded = true,
                Err(e) => failure = failure.or(Some(e)),
            }
        }

        if failure.is_some() || superseded {
            // Fail-atomic: no partially-applied pool state is observable
            for entry in built {
                entry.auth.shutdown();
            }
            return match failure {
                Some(e) => {
                    warn!(error = %e, "Reconcile aborted, batch rolled back");
                    Err(e)
                }
                None => {
                    debug!("Reconcile superseded by a newer pass");
                    Ok(ReconcileSummary {
                        superseded: true,
                        ..Default::default()
                    })
                }
            };
        }

        let mut summary = ReconcileSummary::default();
        {
            let mut entries = self.entries.lock().expect("pool lock poisoned");
            summary.built = built.len();
            for entry in built {
                entries.insert(entry.meta.id.clone(), entry);
            }
            let stale: Vec<ClusterId> = entries
                .keys()
                .filter(|id| !desired_map.contains_key(*id))
                .cloned()
                .collect();
            for id in stale {
                if let Some(entry) = entries.remove(&id) {
                    entry.auth.shutdown();
                    info!(cluster = %id, "Cluster no longer desired, torn down");
                    summary.removed += 1;
                }
            }
        }

        if summary.built > 0 || summary.removed > 0 {
            info!(
                built = summary.built,
                removed = summary.removed,
                live = self.len(),
                "Reconcile complete"
            );
        } else {
            debug!("Reconcile complete, nothing to do");
        }
        Ok(summary)
    }

    /// Build one entry through the coordinator. The monitor outlives the
    /// operation here so that a superseded or failed build can still shut
    /// it down.
    async fn build_entry(
        &self,
        id: ClusterId,
        selection: ClusterSelection,
    ) -> Result<Option<Arc<ClusterEntry>>> {
        let monitor = AuthMonitor::new(
            id.clone(),
            self.config.auth.clone(),
            AuthCallbacks::default(),
            self.telemetry.clone(),
        );

        let result = self
            .coordinator
            .run(&self.root, OperationKey::Scoped(id.clone()), |_token| {
                let monitor = monitor.clone();
                let factory = self.factory.clone();
                let telemetry = self.telemetry.clone();
                let id = id.clone();
                let selection = selection.clone();
                async move {
                    let transport = AuthInterceptLayer::new(monitor.clone());
                    let handles = factory.connect(&selection, transport).await.map_err(|e| {
                        match e {
                            Error::Construction { .. } => e,
                            other => Error::construction(id.to_string(), other.to_string()),
                        }
                    })?;

                    // The probe needs the freshly built client, so it can
                    // only be attached now
                    let probe = handles.probe.clone();
                    monitor.set_recovery_probe(move || {
                        let probe = probe.clone();
                        async move { probe.check().await }.boxed()
                    });

                    let mut auth_failed_on_init = false;
                    match handles.probe.check().await {
                        Ok(()) => telemetry.transport_result(&id, true),
                        Err(e) => {
                            if FailureKind::of(&e).affects_auth_state() {
                                // Bad credentials make a valid pool entry
                                // waiting for recovery, not a build failure
                                monitor.report_failure(&e);
                                auth_failed_on_init = true;
                            } else {
                                telemetry.transport_result(&id, false);
                                warn!(
                                    cluster = %id,
                                    error = %e,
                                    "Pre-flight probe hit a connectivity failure"
                                );
                            }
                        }
                    }

                    info!(cluster = %id, auth_failed_on_init, "Cluster connection built");
                    Ok(Arc::new(ClusterEntry {
                        meta: ClusterMeta {
                            id: id.clone(),
                            name: selection.context.clone(),
                        },
                        selection,
                        handles,
                        auth: monitor.clone(),
                        auth_failed_on_init,
                    }))
                }
            })
            .await;

        match result {
            Ok(Some(entry)) => Ok(Some(entry)),
            Ok(None) => {
                monitor.shutdown();
                Ok(None)
            }
            Err(e) => {
                monitor.shutdown();
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&self, entry: Arc<ClusterEntry>) {
        self.entries
            .lock()
            .expect("pool lock poisoned")
            .insert(entry.meta.id.clone(), entry);
    }
}
