//! Cluster identity: selections, stable IDs, and metadata
//!
//! A [`ClusterSelection`] is the caller-facing identity of one target
//! endpoint before any connection exists: a kubeconfig path plus a context
//! name inside it. The derived [`ClusterId`] is stable across restarts for
//! the same selection and folds the file path into a digest, so two files
//! that both contain a context named `"same-context"` resolve to two
//! distinct clusters instead of colliding.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex digits of the path digest appended to the context name in an ID.
/// Enough to separate files; short enough to keep IDs readable in logs.
const ID_DIGEST_LEN: usize = 10;

/// Stable key for one live cluster.
///
/// Unique among live clusters and deterministic across restarts for the
/// same selection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Wrap an already-derived ID (e.g. parsed back out of a query scope)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The caller-visible identity of one target endpoint before any
/// connection object exists
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSelection {
    /// Path to the kubeconfig file holding the context
    pub path: PathBuf,
    /// Name of the context inside that file
    pub context: String,
}

impl ClusterSelection {
    /// Create a selection from a kubeconfig path and context name
    pub fn new(path: impl Into<PathBuf>, context: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            context: context.into(),
        }
    }

    /// Derive the stable cluster ID for this selection.
    ///
    /// Returns `None` when the selection cannot resolve to an identity
    /// (empty context name); the reconciler drops such selections with a
    /// logged warning rather than failing the whole pass.
    pub fn cluster_id(&self) -> Option<ClusterId> {
        if self.context.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.path.as_os_str().as_encoded_bytes());
        hasher.update([0u8]);
        hasher.update(self.context.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(ID_DIGEST_LEN);
        for byte in digest.iter().take(ID_DIGEST_LEN.div_ceil(2)) {
            hex.push_str(&format!("{byte:02x}"));
        }
        hex.truncate(ID_DIGEST_LEN);
        Some(ClusterId(format!("{}-{hex}", self.context)))
    }

    /// Human-readable rendering for logs and error messages
    pub fn describe(&self) -> String {
        format!("{}:{}", self.path.display(), self.context)
    }
}

/// Identity of one live cluster, immutable once created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMeta {
    /// Stable key derived from the selection
    pub id: ClusterId,
    /// Display name (the context name)
    pub name: String,
}

impl ClusterMeta {
    /// Build metadata for a selection, if it resolves to an ID
    pub fn from_selection(selection: &ClusterSelection) -> Option<Self> {
        Some(Self {
            id: selection.cluster_id()?,
            name: selection.context.clone(),
        })
    }
}
