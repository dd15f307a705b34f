//! Error types for Armada
//!
//! The taxonomy separates failures that feed the per-cluster auth state
//! machine (credential and authorization errors) from transient network
//! conditions (connectivity errors) that must never flip auth state.
//! [`FailureKind`] is the single place where that classification happens.

use thiserror::Error;

use crate::selection::ClusterId;

/// Main error type for Armada operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Credential or token failure for one cluster (recoverable via backoff)
    #[error("credential error: {0}")]
    Credential(String),

    /// Transient network failure (timeout, refused connection, DNS)
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Caller omitted a required cluster scope; rejected before any network call
    #[error("cluster scope required for '{domain}' queries")]
    ScopeRequired {
        /// Query domain the caller asked for
        domain: String,
    },

    /// RBAC-style denial, distinguishable end-to-end so callers can render
    /// a 403-class response instead of a generic failure
    #[error("permission denied on {resource} ({domain}): {message}")]
    PermissionDenied {
        /// Query domain the denial applies to
        domain: String,
        /// Resource the denial applies to
        resource: String,
        /// Message from the remote endpoint
        message: String,
    },

    /// Fatal failure while building a cluster connection; aborts and rolls
    /// back the whole reconcile batch
    #[error("construction error for cluster {cluster}: {message}")]
    Construction {
        /// Cluster whose build failed
        cluster: String,
        /// What went wrong
        message: String,
    },

    /// Every cluster targeted by an aggregate query failed
    #[error("every targeted cluster failed ({} failures)", .failures.len())]
    AggregateExhausted {
        /// Per-cluster failures, in target order
        failures: Vec<(ClusterId, Error)>,
    },

    /// The same selection appeared twice in one desired set
    #[error("duplicate cluster selection: {0}")]
    DuplicateSelection(String),

    /// A coordinated operation exceeded its hard ceiling timeout
    #[error("operation timed out for cluster {0}")]
    OperationTimeout(String),

    /// Kubernetes client error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Create a credential error with the given message
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a connectivity error with the given message
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    /// Create a construction error for the given cluster
    pub fn construction(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Construction {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a permission-denied error matching the Forbidden/403 status
    /// shape reported by the API server
    pub fn permission_denied(
        domain: impl Into<String>,
        resource: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::PermissionDenied {
            domain: domain.into(),
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// True if this error is classifiable as an RBAC denial.
    ///
    /// An [`Error::AggregateExhausted`] is permission-denied only when every
    /// underlying per-cluster failure is, so a caller rendering a 403-class
    /// response never masks a different failure mode.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::PermissionDenied { .. } => true,
            Self::AggregateExhausted { failures } => {
                !failures.is_empty() && failures.iter().all(|(_, e)| e.is_permission_denied())
            }
            Self::Kube(kube::Error::Api(resp)) => resp.code == 403,
            _ => false,
        }
    }
}

/// How a failure relates to the auth state machine.
///
/// Only [`FailureKind::Credential`] and [`FailureKind::PermissionDenied`]
/// feed the state machine; [`FailureKind::Connectivity`] is tracked by the
/// separate transport counters and never flips auth state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Expired, revoked, or otherwise unusable credentials (401-equivalent)
    Credential,
    /// Transient network condition (timeout, refused, DNS)
    Connectivity,
    /// Authenticated but not authorized (403-equivalent)
    PermissionDenied,
}

/// Substrings that mark an opaque error as credential-related.
///
/// Fallback only: structured status codes are always checked first. Exec
/// providers (cloud SSO helpers and the like) fail before any HTTP request
/// exists, so their errors arrive as plain text. Not exhaustive.
const CREDENTIAL_PATTERNS: &[&str] = &[
    "unauthorized",
    "sso session",
    "token has expired",
    "token expired",
    "exec plugin",
    "credential",
];

impl FailureKind {
    /// Classify an error as credential, connectivity, or permission-denied.
    ///
    /// Prefers structured classification (API status codes, kube auth
    /// errors) and falls back to pattern matching on the rendered message
    /// only for opaque failures.
    pub fn of(err: &Error) -> Self {
        match err {
            Error::Credential(_) => Self::Credential,
            Error::PermissionDenied { .. } => Self::PermissionDenied,
            Error::Connectivity(_) | Error::OperationTimeout(_) => Self::Connectivity,
            Error::Kube(kube::Error::Api(resp)) => match resp.code {
                401 => Self::Credential,
                403 => Self::PermissionDenied,
                _ => Self::Connectivity,
            },
            Error::Kube(kube::Error::Auth(_)) => Self::Credential,
            other => Self::from_message(&other.to_string()),
        }
    }

    fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if CREDENTIAL_PATTERNS.iter().any(|p| lower.contains(p)) {
            Self::Credential
        } else {
            Self::Connectivity
        }
    }

    /// True for the kinds that feed the auth state machine
    pub fn affects_auth_state(self) -> bool {
        matches!(self, Self::Credential | Self::PermissionDenied)
    }
}
