//! Operational visibility into per-cluster auth state
//!
//! Operational tooling asks "which clusters are broken and why" without
//! caring how the pool works. These snapshots are serializable and carry
//! no control-flow weight: nothing in the core reads them back.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::auth::{AuthState, AuthStatus};
use crate::pool::ClusterPool;
use crate::selection::ClusterId;

/// Auth state as reported to operators
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticState {
    /// Credentials usable
    Valid,
    /// Recovery probes running
    Recovering,
    /// Credentials unusable
    Invalid,
    /// No auth monitor attached (cluster not in the pool)
    Unknown,
}

impl fmt::Display for DiagnosticState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Valid => "valid",
            Self::Recovering => "recovering",
            Self::Invalid => "invalid",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl From<AuthState> for DiagnosticState {
    fn from(state: AuthState) -> Self {
        match state {
            AuthState::Valid => Self::Valid,
            AuthState::Recovering => Self::Recovering,
            AuthState::Invalid => Self::Invalid,
        }
    }
}

/// Snapshot of one cluster's auth state
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuthDiagnostics {
    /// Current state
    pub state: DiagnosticState,
    /// Why the cluster is not valid; empty otherwise
    pub reason: String,
}

impl AuthDiagnostics {
    /// Snapshot for a cluster with no monitor attached
    pub fn unknown() -> Self {
        Self {
            state: DiagnosticState::Unknown,
            reason: String::new(),
        }
    }
}

impl From<AuthStatus> for AuthDiagnostics {
    fn from(status: AuthStatus) -> Self {
        Self {
            state: status.state.into(),
            reason: status.reason,
        }
    }
}

/// Pool-wide auth snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolDiagnostics {
    /// Worst state across all clusters (`unknown` for an empty pool)
    pub overall: DiagnosticState,
    /// Per-cluster snapshots, keyed by cluster ID
    pub clusters: BTreeMap<String, AuthDiagnostics>,
}

impl ClusterPool {
    /// Snapshot for one cluster; `unknown` if it is not in the pool
    pub fn diagnostics_for(&self, id: &ClusterId) -> AuthDiagnostics {
        match self.get(id) {
            Some(entry) => entry.auth.status().into(),
            None => AuthDiagnostics::unknown(),
        }
    }

    /// Snapshot across the whole pool
    pub fn diagnostics(&self) -> PoolDiagnostics {
        let mut clusters = BTreeMap::new();
        let mut overall = DiagnosticState::Unknown;
        for entry in self.entries() {
            let diag: AuthDiagnostics = entry.auth.status().into();
            overall = worst(overall, diag.state);
            clusters.insert(entry.meta.id.to_string(), diag);
        }
        PoolDiagnostics { overall, clusters }
    }
}

/// Order states by badness so the rollup surfaces the worst one
fn worst(a: DiagnosticState, b: DiagnosticState) -> DiagnosticState {
    fn rank(s: DiagnosticState) -> u8 {
        match s {
            DiagnosticState::Unknown => 0,
            DiagnosticState::Valid => 1,
            DiagnosticState::Recovering => 2,
            DiagnosticState::Invalid => 3,
        }
    }
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}
