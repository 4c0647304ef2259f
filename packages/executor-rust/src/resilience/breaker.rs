//! Circuit breaker isolating callers from a failing remote dependency.
//!
//! # States
//! - Closed: calls pass through
//! - Open: calls fail immediately without reaching the remote service
//! - Half-Open: one probe call is admitted to test recovery
//!
//! # Transitions
//! ```text
//! Closed   -> Open:     consecutive counted failures >= failure_threshold
//! Open     -> HalfOpen: a call arrives after recovery_timeout
//! HalfOpen -> Closed:   probe succeeds
//! HalfOpen -> Open:     probe fails
//! ```
//!
//! Whether a failure counts is decided by
//! [`FailureClass::counts_toward_breaker`](modguard_core::FailureClass::counts_toward_breaker);
//! uncounted failures propagate without touching the statistics.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use modguard_core::{OperationKind, RemoteError};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::policy::BreakerConfig;
use crate::monitor::ModerationMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Outcome of a call rejected or failed by the breaker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerError {
    /// The breaker rejected the call; the wrapped function was not invoked.
    #[error("circuit breaker open for {kind}")]
    Open {
        kind: OperationKind,
        /// Time left before a probe will be admitted.
        retry_in: Duration,
    },
    /// The wrapped function ran and failed.
    #[error(transparent)]
    Call(RemoteError),
}

/// Observable breaker counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStats {
    pub kind: OperationKind,
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub rejected: u64,
    pub trips: u64,
    pub since_last_failure: Option<Duration>,
    pub since_last_transition: Duration,
}

struct BreakerState {
    state: CircuitState,
    total_requests: u64,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    rejected: u64,
    trips: u64,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    last_transition_at: Instant,
    probe_in_flight: bool,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.last_transition_at = Instant::now();
    }
}

/// Failure-isolation state machine for one operation kind.
pub struct CircuitBreaker {
    kind: OperationKind,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    monitor: Option<Arc<ModerationMonitor>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(kind: OperationKind, config: BreakerConfig) -> Self {
        Self {
            kind,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                total_requests: 0,
                successes: 0,
                failures: 0,
                consecutive_failures: 0,
                rejected: 0,
                trips: 0,
                last_failure_at: None,
                opened_at: None,
                last_transition_at: Instant::now(),
                probe_in_flight: false,
            }),
            monitor: None,
        }
    }

    /// Report trips to `monitor`.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<ModerationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Current state. Does not itself move `Open` to `HalfOpen`; only a call does.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Invoke `f` unless the breaker rejects the call.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Open`] without invoking `f` while open (or while a
    /// half-open probe is already in flight); [`BreakerError::Call`] with
    /// `f`'s own error otherwise.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut permit = self.admit()?;
        let result = f().await;
        match &result {
            Ok(_) => self.on_success(permit.probe),
            Err(err) if err.class.counts_toward_breaker() => self.on_failure(permit.probe, err),
            Err(_) => self.on_uncounted(permit.probe),
        }
        permit.settled = true;
        result.map_err(BreakerError::Call)
    }

    /// Force the breaker closed and clear the consecutive-failure count.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.probe_in_flight = false;
        state.opened_at = None;
        if state.state != CircuitState::Closed {
            state.transition(CircuitState::Closed);
        }
        info!(kind = %self.kind, "circuit breaker manually reset");
    }

    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let state = self.state.lock();
        BreakerStats {
            kind: self.kind,
            state: state.state,
            failure_threshold: self.config.failure_threshold,
            total_requests: state.total_requests,
            successes: state.successes,
            failures: state.failures,
            consecutive_failures: state.consecutive_failures,
            rejected: state.rejected,
            trips: state.trips,
            since_last_failure: state.last_failure_at.map(|at| at.elapsed()),
            since_last_transition: state.last_transition_at.elapsed(),
        }
    }

    fn admit(&self) -> Result<CallPermit<'_>, BreakerError> {
        let mut state = self.state.lock();
        state.total_requests += 1;

        match state.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let open_for = state.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                if open_for >= self.config.recovery_timeout {
                    state.transition(CircuitState::HalfOpen);
                    state.probe_in_flight = true;
                    info!(kind = %self.kind, "circuit breaker half-open, admitting probe");
                    Ok(CallPermit::new(self, true))
                } else {
                    state.rejected += 1;
                    Err(BreakerError::Open {
                        kind: self.kind,
                        retry_in: self.config.recovery_timeout - open_for,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    state.rejected += 1;
                    Err(BreakerError::Open {
                        kind: self.kind,
                        retry_in: Duration::ZERO,
                    })
                } else {
                    state.probe_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut state = self.state.lock();
        state.successes += 1;
        state.consecutive_failures = 0;
        if probe {
            state.probe_in_flight = false;
        }
        if state.state == CircuitState::HalfOpen {
            state.opened_at = None;
            state.transition(CircuitState::Closed);
            info!(kind = %self.kind, "circuit breaker closed after successful probe");
        }
    }

    fn on_failure(&self, probe: bool, err: &RemoteError) {
        let tripped = {
            let mut state = self.state.lock();
            state.failures += 1;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_failure_at = Some(Instant::now());
            if probe {
                state.probe_in_flight = false;
            }

            let trip = match state.state {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => state.consecutive_failures >= self.config.failure_threshold,
                CircuitState::Open => false,
            };
            if trip {
                state.trips += 1;
                state.opened_at = Some(Instant::now());
                state.transition(CircuitState::Open);
                warn!(
                    kind = %self.kind,
                    consecutive_failures = state.consecutive_failures,
                    recovery_ms = u64::try_from(self.config.recovery_timeout.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "circuit breaker opened"
                );
            }
            trip
        };

        if tripped {
            if let Some(monitor) = &self.monitor {
                monitor.record_circuit_breaker_trip(self.kind);
            }
        }
    }

    fn on_uncounted(&self, probe: bool) {
        if probe {
            self.state.lock().probe_in_flight = false;
        }
    }
}

/// Admission ticket for one call. Releases the half-open probe slot if the
/// call is dropped before it settles.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.state.lock().probe_in_flight = false;
        }
    }
}
