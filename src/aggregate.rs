//! Multi-cluster query aggregation
//!
//! The [`Aggregator`] answers one logical query against a set of clusters
//! and merges the per-cluster results, tolerating partial failure: as long
//! as at least one cluster in scope returned data, the aggregate succeeds
//! and every other cluster's failure degrades to a warning. Only when
//! every targeted cluster fails does the aggregate itself fail, and a
//! permission-denied classification survives the merge so callers can
//! render an RBAC-specific message.
//!
//! Clusters do not know they are part of an aggregate: the same domain and
//! scope are forwarded verbatim to each cluster's local query service.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::pool::ClusterPool;
use crate::selection::ClusterId;
use crate::{Error, Result};

/// Which clusters a query targets.
///
/// Empty scope is not "all clusters": it falls back to the caller's
/// primary cluster, or to the sole configured cluster, and otherwise the
/// query is rejected with [`Error::ScopeRequired`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryScope {
    ids: Vec<ClusterId>,
}

impl QueryScope {
    /// Scope targeting no explicit cluster
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scope targeting the given clusters
    pub fn of(ids: impl IntoIterator<Item = ClusterId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Parse a comma-separated ID list (the wire form used by callers)
    pub fn parse(raw: &str) -> Self {
        Self {
            ids: raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ClusterId::new)
                .collect(),
        }
    }

    /// True when no explicit cluster was named
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The explicitly named clusters, in caller order
    pub fn ids(&self) -> &[ClusterId] {
        &self.ids
    }
}

/// Result payload from one cluster's query service
#[derive(Clone, Debug, PartialEq)]
pub enum QueryPayload {
    /// List-shaped result; aggregates by concatenation
    List(Vec<serde_json::Value>),
    /// Singular result; the primary cluster's value wins in an aggregate
    Single(serde_json::Value),
}

impl QueryPayload {
    /// Fold another cluster's payload into this one
    fn fold(self, other: QueryPayload) -> QueryPayload {
        match (self, other) {
            (QueryPayload::List(mut a), QueryPayload::List(b)) => {
                a.extend(b);
                QueryPayload::List(a)
            }
            (QueryPayload::List(mut a), QueryPayload::Single(v)) => {
                a.push(v);
                QueryPayload::List(a)
            }
            // Singular payloads do not merge; the earlier (primary) one wins
            (single @ QueryPayload::Single(_), _) => single,
        }
    }

    /// Number of items (1 for a singular payload)
    pub fn len(&self) -> usize {
        match self {
            QueryPayload::List(items) => items.len(),
            QueryPayload::Single(_) => 1,
        }
    }

    /// True for an empty list payload
    pub fn is_empty(&self) -> bool {
        matches!(self, QueryPayload::List(items) if items.is_empty())
    }
}

/// Local per-cluster query service, exposed by each pool entry.
///
/// The aggregator is agnostic to what `domain` means; implementations
/// interpret it against their cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterQuery: Send + Sync {
    /// Answer one logical query against this cluster
    async fn build(&self, domain: &str, scope: &QueryScope) -> Result<QueryPayload>;
}

/// Merged answer to a multi-cluster query
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateResult {
    /// Combined payload from every cluster that succeeded
    pub payload: QueryPayload,
    /// One human-readable warning per failed cluster,
    /// `"Cluster <ID>: <reason>"`
    pub warnings: Vec<String>,
}

/// Fans one logical query out to every targeted cluster and merges the
/// results
pub struct Aggregator {
    pool: Arc<ClusterPool>,
}

impl Aggregator {
    /// Create an aggregator over a pool
    pub fn new(pool: Arc<ClusterPool>) -> Self {
        Self { pool }
    }

    /// Answer `domain` across the clusters resolved from `scope`.
    ///
    /// `primary` is the fallback target for an empty scope and decides
    /// whose singular payload wins a merge. Fails with
    /// [`Error::ScopeRequired`] before any network call when no cluster
    /// resolves.
    #[instrument(skip_all, fields(domain = %domain))]
    pub async fn build(
        &self,
        domain: &str,
        scope: &QueryScope,
        primary: Option<&ClusterId>,
    ) -> Result<AggregateResult> {
        let targets = self.resolve_targets(scope, primary);
        if targets.is_empty() {
            return Err(Error::ScopeRequired {
                domain: domain.to_string(),
            });
        }
        debug!(targets = targets.len(), "Fanning query out");

        // All calls are issued concurrently; one cluster's failure never
        // cancels another's in-flight call
        let calls = targets.iter().map(|id| {
            let id = id.clone();
            async move {
                let outcome = self.query_one(&id, domain, scope).await;
                (id, outcome)
            }
        });
        let outcomes = join_all(calls).await;

        merge(primary, outcomes)
    }

    /// Resolve the target ID list: explicit scope first, then the primary
    /// cluster, then the sole configured cluster
    fn resolve_targets(&self, scope: &QueryScope, primary: Option<&ClusterId>) -> Vec<ClusterId> {
        if !scope.is_empty() {
            let mut seen = Vec::new();
            for id in scope.ids() {
                if !seen.contains(id) {
                    seen.push(id.clone());
                }
            }
            return seen;
        }
        if let Some(primary) = primary {
            return vec![primary.clone()];
        }
        let ids = self.pool.ids();
        if ids.len() == 1 {
            ids
        } else {
            Vec::new()
        }
    }

    /// Query one cluster, gated by its auth state
    async fn query_one(
        &self,
        id: &ClusterId,
        domain: &str,
        scope: &QueryScope,
    ) -> Result<QueryPayload> {
        let Some(entry) = self.pool.get(id) else {
            return Err(Error::connectivity(format!("cluster {id} is not connected")));
        };
        if !entry.auth.is_valid() {
            let status = entry.auth.status();
            return Err(Error::credential(format!(
                "credentials {}: {}",
                status.state, status.reason
            )));
        }
        entry.handles.query.build(domain, scope).await
    }
}

/// Merge per-cluster outcomes: any success carries the aggregate, all
/// other failures degrade to warnings
fn merge(
    primary: Option<&ClusterId>,
    outcomes: Vec<(ClusterId, Result<QueryPayload>)>,
) -> Result<AggregateResult> {
    let mut successes: Vec<(ClusterId, QueryPayload)> = Vec::new();
    let mut failures: Vec<(ClusterId, Error)> = Vec::new();
    for (id, outcome) in outcomes {
        match outcome {
            Ok(payload) => successes.push((id, payload)),
            Err(e) => {
                warn!(cluster = %id, error = %e, "Cluster failed during aggregation");
                failures.push((id, e));
            }
        }
    }

    // Put the primary cluster's payload first so it wins singular merges
    if let Some(primary) = primary {
        if let Some(pos) = successes.iter().position(|(id, _)| id == primary) {
            let entry = successes.remove(pos);
            successes.insert(0, entry);
        }
    }

    let mut merged = None;
    for (_, payload) in successes {
        merged = Some(match merged {
            None => payload,
            Some(acc) => QueryPayload::fold(acc, payload),
        });
    }

    match merged {
        None => Err(Error::AggregateExhausted { failures }),
        Some(payload) => {
            let warnings = failures
                .iter()
                .map(|(id, e)| format!("Cluster {id}: {e}"))
                .collect();
            Ok(AggregateResult { payload, warnings })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::auth::{AuthCallbacks, AuthConfig, AuthMonitor};
    use crate::factory::{ClusterHandles, MockHealthProbe};
    use crate::pool::{ClusterEntry, ClusterPool, PoolConfig};
    use crate::selection::{ClusterMeta, ClusterSelection};
    use crate::telemetry::ConnectivityStats;

    /// Pool with no factory behind it; entries are installed directly
    fn empty_pool() -> Arc<ClusterPool> {
        let factory = crate::factory::MockConnectionFactory::new();
        Arc::new(ClusterPool::new(
            Arc::new(factory),
            ConnectivityStats::new(),
            PoolConfig::default(),
        ))
    }

    /// Install an entry whose query service answers with `response` and
    /// whose auth state is driven by `broken`
    fn install(
        pool: &ClusterPool,
        name: &str,
        broken: Option<Error>,
        response: impl Fn() -> Result<QueryPayload> + Send + Sync + 'static,
    ) -> ClusterId {
        let selection = ClusterSelection::new(format!("/tmp/{name}"), name);
        let id = selection.cluster_id().unwrap();
        let auth = AuthMonitor::new(
            id.clone(),
            AuthConfig::disabled(),
            AuthCallbacks::default(),
            ConnectivityStats::new(),
        );
        if let Some(err) = broken {
            auth.report_failure(&err);
        }
        let mut query = MockClusterQuery::new();
        query.expect_build().returning(move |_, _| response());
        pool.insert_for_tests(Arc::new(ClusterEntry {
            meta: ClusterMeta {
                id: id.clone(),
                name: name.to_string(),
            },
            selection,
            handles: ClusterHandles {
                probe: Arc::new(MockHealthProbe::new()),
                query: Arc::new(query),
                kube: None,
            },
            auth,
            auth_failed_on_init: false,
        }));
        id
    }

    fn list(items: &[&str]) -> QueryPayload {
        QueryPayload::List(items.iter().map(|i| json!({ "name": i })).collect())
    }

    #[tokio::test]
    async fn partial_failure_degrades_to_a_warning() {
        let pool = empty_pool();
        let a = install(&pool, "a", None, || Ok(list(&["pod-1", "pod-2"])));
        let b = install(&pool, "b", None, || {
            Err(Error::permission_denied("pods", "pods", "cannot list pods"))
        });

        let agg = Aggregator::new(pool);
        let scope = QueryScope::of([a.clone(), b.clone()]);
        let result = agg.build("pods", &scope, Some(&a)).await.unwrap();

        assert_eq!(result.payload, list(&["pod-1", "pod-2"]));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains(&format!("Cluster {b}")));
        assert!(result.warnings[0].contains("permission denied"));
    }

    #[tokio::test]
    async fn all_clusters_failing_fails_the_aggregate() {
        let pool = empty_pool();
        let a = install(&pool, "a", None, || {
            Err(Error::permission_denied("pods", "pods", "cannot list pods"))
        });
        let b = install(&pool, "b", None, || {
            Err(Error::permission_denied("pods", "pods", "cannot list pods"))
        });

        let agg = Aggregator::new(pool);
        let scope = QueryScope::of([a, b]);
        let err = agg.build("pods", &scope, None).await.unwrap_err();

        assert!(matches!(err, Error::AggregateExhausted { .. }));
        // Both failures were RBAC denials, so the aggregate stays
        // classifiable as one
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn mixed_failures_are_not_permission_denied() {
        let pool = empty_pool();
        let a = install(&pool, "a", None, || {
            Err(Error::permission_denied("pods", "pods", "cannot list pods"))
        });
        let b = install(&pool, "b", None, || Err(Error::connectivity("timeout")));

        let agg = Aggregator::new(pool);
        let err = agg
            .build("pods", &QueryScope::of([a, b]), None)
            .await
            .unwrap_err();
        assert!(!err.is_permission_denied());
    }

    #[tokio::test]
    async fn empty_scope_falls_back_to_the_primary_cluster() {
        let pool = empty_pool();
        let a = install(&pool, "a", None, || Ok(list(&["pod-1"])));
        let _b = install(
            &pool,
            "b",
            Some(Error::credential("token expired")),
            || Ok(list(&["never-queried"])),
        );

        let agg = Aggregator::new(pool);
        let result = agg
            .build("pods", &QueryScope::empty(), Some(&a))
            .await
            .unwrap();

        // Only the primary was targeted, so the broken cluster produces
        // no warning
        assert_eq!(result.payload, list(&["pod-1"]));
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn scoping_in_a_broken_cluster_yields_its_warning() {
        let pool = empty_pool();
        let a = install(&pool, "a", None, || Ok(list(&["pod-1"])));
        let b = install(
            &pool,
            "b",
            Some(Error::credential("token expired")),
            || Ok(list(&["never-queried"])),
        );

        let agg = Aggregator::new(pool);
        let scope = QueryScope::of([a.clone(), b.clone()]);
        let result = agg.build("pods", &scope, Some(&a)).await.unwrap();

        assert_eq!(result.payload, list(&["pod-1"]));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains(&format!("Cluster {b}")));
        assert!(result.warnings[0].contains("token expired"));
    }

    #[tokio::test]
    async fn empty_scope_without_primary_requires_a_sole_cluster() {
        let pool = empty_pool();
        install(&pool, "a", None, || Ok(list(&["pod-1"])));
        install(&pool, "b", None, || Ok(list(&["pod-2"])));

        let agg = Aggregator::new(pool);
        let err = agg
            .build("pods", &QueryScope::empty(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScopeRequired { .. }));
    }

    #[tokio::test]
    async fn sole_configured_cluster_is_the_default_target() {
        let pool = empty_pool();
        install(&pool, "only", None, || Ok(list(&["pod-1"])));

        let agg = Aggregator::new(pool);
        let result = agg
            .build("pods", &QueryScope::empty(), None)
            .await
            .unwrap();
        assert_eq!(result.payload, list(&["pod-1"]));
    }

    #[tokio::test]
    async fn unknown_cluster_in_scope_degrades_to_a_warning() {
        let pool = empty_pool();
        let a = install(&pool, "a", None, || Ok(list(&["pod-1"])));
        let ghost = ClusterId::new("ghost-0000000000");

        let agg = Aggregator::new(pool);
        let scope = QueryScope::of([a, ghost.clone()]);
        let result = agg.build("pods", &scope, None).await.unwrap();

        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("not connected"));
    }

    #[tokio::test]
    async fn list_payloads_concatenate_across_clusters() {
        let pool = empty_pool();
        let a = install(&pool, "a", None, || Ok(list(&["a-1"])));
        let b = install(&pool, "b", None, || Ok(list(&["b-1", "b-2"])));

        let agg = Aggregator::new(pool);
        let result = agg
            .build("pods", &QueryScope::of([a, b]), None)
            .await
            .unwrap();
        assert_eq!(result.payload.len(), 3);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn singular_payloads_prefer_the_primary_cluster() {
        let pool = empty_pool();
        let a = install(&pool, "a", None, || {
            Ok(QueryPayload::Single(json!({ "version": "a" })))
        });
        let b = install(&pool, "b", None, || {
            Ok(QueryPayload::Single(json!({ "version": "b" })))
        });

        let agg = Aggregator::new(pool);
        let result = agg
            .build("version", &QueryScope::of([a, b.clone()]), Some(&b))
            .await
            .unwrap();
        assert_eq!(result.payload, QueryPayload::Single(json!({ "version": "b" })));
    }

    #[test]
    fn scope_parsing_trims_and_skips_empty_segments() {
        let scope = QueryScope::parse("a, b,,c ");
        assert_eq!(
            scope.ids(),
            &[ClusterId::new("a"), ClusterId::new("b"), ClusterId::new("c")]
        );
        assert!(QueryScope::parse("").is_empty());
    }
}
