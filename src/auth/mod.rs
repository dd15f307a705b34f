//! Per-cluster authentication state machine
//!
//! Each live cluster owns one [`AuthMonitor`] that decides whether it is
//! safe to issue further requests against that cluster and autonomously
//! attempts recovery after a credential failure. Monitors know nothing
//! about other clusters or about the pool: isolation is the point.
//!
//! State transitions:
//!
//! ```text
//! Valid --report_failure--> Recovering --probe ok--> Valid
//!   |                           |
//!   | (recovery disabled)       | (attempts exhausted)
//!   v                           v
//! Invalid <--retry_now------ Invalid
//! ```
//!
//! Only credential/authorization failures feed this machine. Connectivity
//! failures (timeouts, refused connections, DNS) go to the transport
//! counters in [`crate::telemetry`] and never flip auth state: a network
//! blip must not trigger credential-recovery churn, and an expired token
//! must not be masked as "just a timeout".

pub mod transport;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FailureKind;
use crate::selection::ClusterId;
use crate::telemetry::TelemetrySink;
use crate::{Error, Result};

/// Validity of one cluster's credentials
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthState {
    /// Credentials are usable; requests may be issued
    Valid,
    /// A failure was reported and scheduled recovery probes are running
    Recovering,
    /// Credentials are unusable and recovery is disabled or exhausted
    Invalid,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Valid => "valid",
            Self::Recovering => "recovering",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Snapshot of a monitor's state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthStatus {
    /// Current state
    pub state: AuthState,
    /// Why the cluster is not Valid; empty while Valid
    pub reason: String,
    /// Monotonically increasing count of credential failures observed
    pub failures: u64,
}

/// Recovery probe: a zero-argument check that succeeds when credentials
/// work again. Attached after construction because it usually needs a
/// freshly built client that does not exist until the connection entry
/// is built.
pub type RecoveryProbe = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Callback invoked on every state transition, outside the monitor's lock
pub type StateChangeFn = Box<dyn Fn(AuthState, &str) + Send + Sync>;

/// Callback invoked after each failed recovery attempt with
/// `(attempt, max_attempts)`, outside the monitor's lock
pub type RecoveryProgressFn = Box<dyn Fn(u32, u32) + Send + Sync>;

/// Observer callbacks for a monitor.
///
/// Callbacks may be re-entrant (they are allowed to read the monitor back)
/// and are therefore never invoked while an internal lock is held.
#[derive(Default)]
pub struct AuthCallbacks {
    /// Invoked with the new state and reason on every transition
    pub on_state_change: Option<StateChangeFn>,
    /// Invoked after each failed recovery attempt
    pub on_recovery_progress: Option<RecoveryProgressFn>,
}

/// Recovery configuration for one monitor
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Maximum recovery attempts per failure episode (0 disables recovery)
    pub max_attempts: u32,
    /// Ordered wait durations between attempts; once exhausted the last
    /// entry repeats
    pub backoff: Vec<Duration>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_RECOVERY_ATTEMPTS,
            backoff: vec![
                Duration::from_millis(500),
                Duration::from_secs(2),
                Duration::from_secs(10),
            ],
        }
    }
}

impl AuthConfig {
    /// Config with recovery disabled: the first credential failure goes
    /// straight to Invalid
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Config with a custom attempt limit
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Replace the backoff schedule
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wait before the given 1-based attempt, index-capped at the last
    /// schedule entry
    fn backoff_delay(&self, attempt: u32) -> Duration {
        match self.backoff.last() {
            None => Duration::ZERO,
            Some(last) => {
                let idx = (attempt.saturating_sub(1)) as usize;
                *self.backoff.get(idx).unwrap_or(last)
            }
        }
    }
}

struct Inner {
    state: AuthState,
    reason: String,
    failures: u64,
    /// A recovery task is currently scheduled or running
    task_active: bool,
}

/// Auth state machine for one cluster.
///
/// Constructed into an [`Arc`] because the background recovery task holds
/// a reference. State is owned exclusively by the monitor: callers read it
/// ([`AuthMonitor::is_valid`], [`AuthMonitor::status`]) or post events
/// ([`AuthMonitor::report_failure`]).
pub struct AuthMonitor {
    cluster: ClusterId,
    config: AuthConfig,
    callbacks: AuthCallbacks,
    telemetry: Arc<dyn TelemetrySink>,
    state: Mutex<Inner>,
    probe: Mutex<Option<RecoveryProbe>>,
    shutdown: CancellationToken,
}

impl AuthMonitor {
    /// Create a monitor in the `Valid` state
    pub fn new(
        cluster: ClusterId,
        config: AuthConfig,
        callbacks: AuthCallbacks,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            config,
            callbacks,
            telemetry,
            state: Mutex::new(Inner {
                state: AuthState::Valid,
                reason: String::new(),
                failures: 0,
                task_active: false,
            }),
            probe: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// The cluster this monitor belongs to
    pub fn cluster(&self) -> &ClusterId {
        &self.cluster
    }

    /// True only while credentials are `Valid`
    pub fn is_valid(&self) -> bool {
        self.state() == AuthState::Valid
    }

    /// Current state
    pub fn state(&self) -> AuthState {
        self.state.lock().expect("auth state lock poisoned").state
    }

    /// Snapshot of state, reason, and failure count
    pub fn status(&self) -> AuthStatus {
        let inner = self.state.lock().expect("auth state lock poisoned");
        AuthStatus {
            state: inner.state,
            reason: inner.reason.clone(),
            failures: inner.failures,
        }
    }

    /// Attach or replace the recovery probe.
    ///
    /// The probe is called by the scheduled recovery task; success
    /// transitions the monitor back to `Valid`.
    pub fn set_recovery_probe<F>(&self, probe: F)
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        *self.probe.lock().expect("probe lock poisoned") = Some(Arc::new(probe));
    }

    /// Post a failure to the state machine.
    ///
    /// The error is classified first: connectivity failures only increment
    /// the transport counters and return without touching auth state.
    /// Credential and authorization failures transition to `Recovering`
    /// (scheduling background probes) or straight to `Invalid` when
    /// recovery is disabled.
    pub fn report_failure(self: &Arc<Self>, err: &Error) {
        let kind = FailureKind::of(err);
        if !kind.affects_auth_state() {
            self.telemetry.transport_result(&self.cluster, false);
            debug!(
                cluster = %self.cluster,
                error = %err,
                "Connectivity failure, auth state unchanged"
            );
            return;
        }

        let reason = err.to_string();
        let (new_state, spawn) = {
            let mut inner = self.state.lock().expect("auth state lock poisoned");
            inner.failures += 1;
            inner.reason = reason.clone();
            if self.config.max_attempts == 0 {
                inner.state = AuthState::Invalid;
                (AuthState::Invalid, false)
            } else {
                inner.state = AuthState::Recovering;
                let spawn = !inner.task_active;
                if spawn {
                    inner.task_active = true;
                }
                (AuthState::Recovering, spawn)
            }
        };

        warn!(
            cluster = %self.cluster,
            state = %new_state,
            reason = %reason,
            "Credential failure reported"
        );
        self.notify(new_state, &reason);
        if spawn {
            self.spawn_recovery();
        }
    }

    /// Explicit retry trigger: re-enter `Recovering` from `Invalid`.
    ///
    /// Returns false when recovery is disabled, the monitor is not
    /// `Invalid`, or a recovery task is already scheduled.
    pub fn retry_now(self: &Arc<Self>) -> bool {
        if self.config.max_attempts == 0 {
            return false;
        }
        let reason = {
            let mut inner = self.state.lock().expect("auth state lock poisoned");
            if inner.state != AuthState::Invalid || inner.task_active {
                return false;
            }
            inner.state = AuthState::Recovering;
            inner.task_active = true;
            inner.reason.clone()
        };
        info!(cluster = %self.cluster, "Retry requested, entering recovery");
        self.notify(AuthState::Recovering, &reason);
        self.spawn_recovery();
        true
    }

    /// Stop any pending scheduled recovery. Idempotent and safe to call
    /// from any thread.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn notify(&self, state: AuthState, reason: &str) {
        if let Some(cb) = &self.callbacks.on_state_change {
            cb(state, reason);
        }
    }

    fn spawn_recovery(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.recovery_loop().await });
    }

    async fn recovery_loop(self: Arc<Self>) {
        let max = self.config.max_attempts;
        for attempt in 1..=max {
            let delay = jittered(self.config.backoff_delay(attempt));
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let mut inner = self.state.lock().expect("auth state lock poisoned");
                    inner.task_active = false;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let probe = self.probe.lock().expect("probe lock poisoned").clone();
            let outcome = match probe {
                Some(p) => p().await,
                None => Err(Error::credential("no recovery probe attached")),
            };

            match outcome {
                Ok(()) => {
                    {
                        let mut inner = self.state.lock().expect("auth state lock poisoned");
                        inner.state = AuthState::Valid;
                        inner.reason.clear();
                        inner.task_active = false;
                    }
                    self.telemetry.transport_result(&self.cluster, true);
                    info!(cluster = %self.cluster, attempt, "Credentials recovered");
                    self.notify(AuthState::Valid, "");
                    return;
                }
                Err(e) => {
                    let reason = e.to_string();
                    {
                        let mut inner = self.state.lock().expect("auth state lock poisoned");
                        inner.failures += 1;
                        inner.reason = reason.clone();
                    }
                    self.telemetry.retry_attempt(&self.cluster, attempt, &reason);
                    if let Some(cb) = &self.callbacks.on_recovery_progress {
                        cb(attempt, max);
                    }
                }
            }
        }

        let reason = {
            let mut inner = self.state.lock().expect("auth state lock poisoned");
            inner.state = AuthState::Invalid;
            inner.task_active = false;
            inner.reason.clone()
        };
        self.telemetry.retry_exhausted(&self.cluster, max);
        warn!(cluster = %self.cluster, reason = %reason, "Recovery exhausted, credentials invalid");
        self.notify(AuthState::Invalid, &reason);
    }
}

impl fmt::Debug for AuthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMonitor")
            .field("cluster", &self.cluster)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Add 0.5x-1.5x jitter so many clusters failing at once do not probe in
/// lockstep
fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::FutureExt;

    use crate::telemetry::ConnectivityStats;

    fn monitor(id: &str, config: AuthConfig) -> Arc<AuthMonitor> {
        AuthMonitor::new(
            ClusterId::new(id),
            config,
            AuthCallbacks::default(),
            ConnectivityStats::new(),
        )
    }

    /// Poll until the monitor reaches the wanted state or the deadline hits
    async fn wait_for_state(m: &AuthMonitor, want: AuthState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while m.state() != want {
            assert!(
                tokio::time::Instant::now() < deadline,
                "monitor never reached {want}, stuck at {}",
                m.state()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn starts_valid_with_empty_reason() {
        let m = monitor("prod", AuthConfig::default());
        assert!(m.is_valid());
        let status = m.status();
        assert_eq!(status.state, AuthState::Valid);
        assert!(status.reason.is_empty());
        assert_eq!(status.failures, 0);
    }

    #[test]
    fn disabled_recovery_goes_straight_to_invalid() {
        let m = monitor("prod", AuthConfig::disabled());
        m.report_failure(&Error::credential("token expired"));

        assert!(!m.is_valid());
        let status = m.status();
        assert_eq!(status.state, AuthState::Invalid);
        assert!(status.reason.contains("token expired"));
        assert_eq!(status.failures, 1);
    }

    #[test]
    fn failure_on_one_monitor_leaves_another_untouched() {
        let broken = monitor("broken", AuthConfig::disabled());
        let healthy = monitor("healthy", AuthConfig::disabled());

        broken.report_failure(&Error::credential("token expired"));

        assert!(!broken.is_valid());
        assert!(healthy.is_valid());
        assert_eq!(healthy.status().failures, 0);
    }

    #[test]
    fn connectivity_failures_never_flip_auth_state() {
        let m = monitor("prod", AuthConfig::disabled());
        m.report_failure(&Error::connectivity("dial tcp: connection refused"));
        m.report_failure(&Error::OperationTimeout("prod".to_string()));

        assert!(m.is_valid());
        assert_eq!(m.status().failures, 0);
    }

    #[tokio::test]
    async fn recovery_probe_success_returns_to_valid() {
        let m = monitor(
            "prod",
            AuthConfig::with_max_attempts(3).with_backoff(vec![Duration::from_millis(1)]),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        m.set_recovery_probe(move || {
            let c = c.clone();
            async move {
                // Fail the first attempt, succeed on the second
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::credential("still expired"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        });

        m.report_failure(&Error::credential("token expired"));
        wait_for_state(&m, AuthState::Valid).await;

        let status = m.status();
        assert!(status.reason.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_recovery_ends_invalid() {
        let m = monitor(
            "prod",
            AuthConfig::with_max_attempts(2).with_backoff(vec![Duration::from_millis(1)]),
        );
        m.set_recovery_probe(|| async { Err(Error::credential("still expired")) }.boxed());

        m.report_failure(&Error::credential("token expired"));
        wait_for_state(&m, AuthState::Invalid).await;

        let status = m.status();
        assert!(status.reason.contains("still expired"));
        // Initial failure plus two failed probes
        assert_eq!(status.failures, 3);
    }

    #[tokio::test]
    async fn shutdown_stops_pending_recovery() {
        let m = monitor(
            "prod",
            AuthConfig::with_max_attempts(3).with_backoff(vec![Duration::from_millis(30)]),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        m.set_recovery_probe(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        });

        m.report_failure(&Error::credential("token expired"));
        m.shutdown();
        // Idempotent from any thread
        m.shutdown();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(m.state(), AuthState::Recovering);
    }

    #[tokio::test]
    async fn retry_now_reenters_recovery_from_invalid() {
        let m = monitor(
            "prod",
            AuthConfig::with_max_attempts(1).with_backoff(vec![Duration::from_millis(1)]),
        );
        m.set_recovery_probe(|| async { Err(Error::credential("still expired")) }.boxed());

        m.report_failure(&Error::credential("token expired"));
        wait_for_state(&m, AuthState::Invalid).await;

        m.set_recovery_probe(|| async { Ok(()) }.boxed());
        assert!(m.retry_now());
        wait_for_state(&m, AuthState::Valid).await;
    }

    #[test]
    fn retry_now_is_a_no_op_when_recovery_is_disabled() {
        let m = monitor("prod", AuthConfig::disabled());
        m.report_failure(&Error::credential("token expired"));
        assert!(!m.retry_now());
        assert_eq!(m.state(), AuthState::Invalid);
    }

    #[tokio::test]
    async fn state_change_callback_sees_every_transition() {
        let seen: Arc<Mutex<Vec<(AuthState, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let m = AuthMonitor::new(
            ClusterId::new("prod"),
            AuthConfig::with_max_attempts(1).with_backoff(vec![Duration::from_millis(1)]),
            AuthCallbacks {
                on_state_change: Some(Box::new(move |state, reason| {
                    sink.lock().unwrap().push((state, reason.to_string()));
                })),
                on_recovery_progress: None,
            },
            ConnectivityStats::new(),
        );
        m.set_recovery_probe(|| async { Ok(()) }.boxed());

        m.report_failure(&Error::credential("token expired"));
        wait_for_state(&m, AuthState::Valid).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, AuthState::Recovering);
        assert!(seen[0].1.contains("token expired"));
        let last = seen.last().unwrap();
        assert_eq!(last.0, AuthState::Valid);
        assert!(last.1.is_empty());
    }

    #[test]
    fn backoff_schedule_caps_at_last_entry() {
        let config = AuthConfig::with_max_attempts(5).with_backoff(vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
        ]);
        assert_eq!(config.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(20));
    }
}
