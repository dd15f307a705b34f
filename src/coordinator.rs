//! Per-key lifecycle operation coordination
//!
//! Building, rebuilding, and tearing down a cluster connection are slow,
//! cancellable operations. The [`OperationCoordinator`] guarantees that at
//! most one such operation is in flight per cluster key: starting new work
//! for a key cancels and supersedes whatever is still running for that
//! key, while operations for different keys run fully independently.
//!
//! Supersession is expected, not exceptional: a superseded operation
//! resolves to `Ok(None)` and is never surfaced as a caller-visible error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::selection::ClusterId;
use crate::{Error, Result};

/// Which cluster an operation belongs to.
///
/// `Unscoped` work (global, non-cluster-scoped) bypasses coordination
/// entirely. An explicit variant avoids the trap of treating an empty
/// string key as "no cluster" and colliding with a real empty ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationKey {
    /// Global work: runs directly under the parent token, no slot involved
    Unscoped,
    /// Work for one cluster: superseded by later operations for the same ID
    Scoped(ClusterId),
}

struct Slot {
    /// Serializes execution for the key; taken only after the slot map
    /// lock is released
    gate: Arc<tokio::sync::Mutex<()>>,
    /// Monotonically increasing; identifies the operation currently
    /// allowed to run
    token: u64,
    /// Cancellation handle for that operation, cleared when it finishes
    /// un-superseded
    cancel: Option<CancellationToken>,
}

/// Coordinates lifecycle operations so that per-key work supersedes
/// earlier work for the same key
pub struct OperationCoordinator {
    slots: Mutex<HashMap<ClusterId, Slot>>,
    operation_timeout: Duration,
}

impl Default for OperationCoordinator {
    fn default() -> Self {
        Self::new(crate::DEFAULT_OPERATION_TIMEOUT)
    }
}

impl OperationCoordinator {
    /// Create a coordinator with a hard per-operation ceiling timeout.
    ///
    /// The ceiling is independent of supersession: a wedged remote call
    /// cannot block a key's slot forever.
    pub fn new(operation_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            operation_timeout,
        }
    }

    /// Run `op` under the coordination rules for `key`.
    ///
    /// The operation receives a cancellation token derived from `parent`
    /// and, for scoped keys, from the coordinator's own per-key handle.
    /// Returns `Ok(None)` when the operation was superseded or the parent
    /// was cancelled, `Ok(Some(value))` on completion, and
    /// [`Error::OperationTimeout`] when the ceiling elapses.
    pub async fn run<F, Fut, T>(
        &self,
        parent: &CancellationToken,
        key: OperationKey,
        op: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = match key {
            OperationKey::Unscoped => return op(parent.child_token()).await.map(Some),
            OperationKey::Scoped(id) => id,
        };

        // Cancel the previous holder and install ourselves while the slot
        // map lock is held, so no two callers both believe they are current.
        let (gate, token, my_token) = {
            let mut slots = self.slots.lock().expect("slot map lock poisoned");
            let slot = slots.entry(id.clone()).or_insert_with(|| Slot {
                gate: Arc::new(tokio::sync::Mutex::new(())),
                token: 0,
                cancel: None,
            });
            if let Some(prev) = slot.cancel.take() {
                debug!(cluster = %id, "Superseding in-flight operation");
                prev.cancel();
            }
            slot.token += 1;
            let token = parent.child_token();
            slot.cancel = Some(token.clone());
            (slot.gate.clone(), token, slot.token)
        };

        let outcome = {
            let _guard = gate.lock().await;
            if token.is_cancelled() {
                // Superseded (or parent cancelled) while waiting our turn
                Ok(None)
            } else {
                tokio::select! {
                    _ = token.cancelled() => Ok(None),
                    finished = tokio::time::timeout(self.operation_timeout, op(token.clone())) => {
                        match finished {
                            Ok(Ok(value)) => Ok(Some(value)),
                            Ok(Err(e)) => Err(e),
                            Err(_) => Err(Error::OperationTimeout(id.to_string())),
                        }
                    }
                }
            }
        };

        token.cancel();
        let mut slots = self.slots.lock().expect("slot map lock poisoned");
        if let Some(slot) = slots.get_mut(&id) {
            // Only clear the handle if nobody superseded us while we ran
            if slot.token == my_token {
                slot.cancel = None;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoped(id: &str) -> OperationKey {
        OperationKey::Scoped(ClusterId::new(id))
    }

    #[tokio::test]
    async fn completed_operation_returns_its_value() {
        let coord = OperationCoordinator::new(Duration::from_secs(5));
        let parent = CancellationToken::new();

        let result = coord
            .run(&parent, scoped("a"), |_token| async { Ok(7) })
            .await;
        assert!(matches!(result, Ok(Some(7))));
    }

    #[tokio::test]
    async fn second_operation_cancels_the_first_before_running() {
        let coord = Arc::new(OperationCoordinator::new(Duration::from_secs(5)));
        let parent = CancellationToken::new();
        let (token_tx, token_rx) = tokio::sync::oneshot::channel();

        let c = coord.clone();
        let p = parent.clone();
        let first = tokio::spawn(async move {
            c.run(&p, scoped("k"), |token| async move {
                token_tx.send(token.clone()).ok();
                // Block until superseded; only the coordinator's select can
                // complete this operation
                std::future::pending::<()>().await;
                Ok(1)
            })
            .await
        });

        let first_token = token_rx.await.unwrap();
        let second = coord
            .run(&parent, scoped("k"), move |_token| async move {
                // The first operation's context was cancelled before we began
                assert!(first_token.is_cancelled());
                Ok(2)
            })
            .await;

        assert!(matches!(second, Ok(Some(2))));
        // The superseded operation is swallowed, not an error
        assert!(matches!(first.await.unwrap(), Ok(None)));
    }

    #[tokio::test]
    async fn unscoped_work_never_cancels_scoped_work() {
        let coord = Arc::new(OperationCoordinator::new(Duration::from_secs(5)));
        let parent = CancellationToken::new();
        let release = Arc::new(tokio::sync::Notify::new());
        let (token_tx, token_rx) = tokio::sync::oneshot::channel();

        let c = coord.clone();
        let p = parent.clone();
        let r = release.clone();
        let scoped_op = tokio::spawn(async move {
            c.run(&p, scoped("k"), |token| async move {
                token_tx.send(token.clone()).ok();
                r.notified().await;
                Ok(1)
            })
            .await
        });

        let scoped_token = token_rx.await.unwrap();
        let unscoped = coord
            .run(&parent, OperationKey::Unscoped, |_token| async { Ok(0) })
            .await;
        assert!(matches!(unscoped, Ok(Some(0))));
        assert!(!scoped_token.is_cancelled());

        release.notify_one();
        assert!(matches!(scoped_op.await.unwrap(), Ok(Some(1))));
    }

    #[tokio::test]
    async fn operations_for_different_keys_run_concurrently() {
        let coord = Arc::new(OperationCoordinator::new(Duration::from_secs(5)));
        let parent = CancellationToken::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let mut handles = Vec::new();
        for key in ["a", "b"] {
            let c = coord.clone();
            let p = parent.clone();
            let b = barrier.clone();
            let k = scoped(key);
            handles.push(tokio::spawn(async move {
                c.run(&p, k, |_token| async move {
                    // Both operations must be in flight at once to pass
                    b.wait().await;
                    Ok(())
                })
                .await
            }));
        }

        let joined = tokio::time::timeout(Duration::from_secs(2), async {
            for handle in handles {
                assert!(matches!(handle.await.unwrap(), Ok(Some(()))));
            }
        })
        .await;
        assert!(joined.is_ok(), "operations serialized across distinct keys");
    }

    #[tokio::test]
    async fn ceiling_timeout_fails_a_wedged_operation() {
        let coord = OperationCoordinator::new(Duration::from_millis(20));
        let parent = CancellationToken::new();

        let result: Result<Option<()>> = coord
            .run(&parent, scoped("k"), |_token| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::OperationTimeout(_))));
    }

    #[tokio::test]
    async fn cancelled_parent_skips_the_operation() {
        let coord = OperationCoordinator::new(Duration::from_secs(5));
        let parent = CancellationToken::new();
        parent.cancel();

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let result = coord
            .run(&parent, scoped("k"), |_token| async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Ok(None)));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
