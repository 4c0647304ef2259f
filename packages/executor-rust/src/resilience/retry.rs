//! Retry loop running each attempt through the kind's circuit breaker.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use modguard_core::{FailureClass, OperationKind, RemoteError};
use tracing::{debug, warn};

use super::backoff::{backoff_delay, rate_limit_delay};
use super::breaker::{BreakerError, BreakerStats, CircuitBreaker};
use super::policy::PolicyRegistry;
use crate::error::ExecutionError;
use crate::monitor::ModerationMonitor;

/// Retries transient remote failures with backoff. Owns one breaker per
/// operation kind, created lazily from the kind's policy.
pub struct RetryHandler {
    policies: Arc<PolicyRegistry>,
    breakers: DashMap<OperationKind, Arc<CircuitBreaker>>,
    monitor: Option<Arc<ModerationMonitor>>,
}

impl RetryHandler {
    #[must_use]
    pub fn new(policies: Arc<PolicyRegistry>) -> Self {
        Self {
            policies,
            breakers: DashMap::new(),
            monitor: None,
        }
    }

    /// Like [`RetryHandler::new`]; breakers report trips to `monitor`.
    #[must_use]
    pub fn with_monitor(policies: Arc<PolicyRegistry>, monitor: Arc<ModerationMonitor>) -> Self {
        Self {
            monitor: Some(monitor),
            ..Self::new(policies)
        }
    }

    #[must_use]
    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// The breaker guarding `kind`, created on first use.
    pub fn breaker(&self, kind: OperationKind) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(kind)
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(kind, self.policies.retry(kind).breaker);
                Arc::new(match &self.monitor {
                    Some(monitor) => breaker.with_monitor(Arc::clone(monitor)),
                    None => breaker,
                })
            })
            .clone()
    }

    /// Stats for every breaker created so far, ordered by kind.
    #[must_use]
    pub fn breaker_stats(&self) -> Vec<(OperationKind, BreakerStats)> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (*entry.key(), entry.value().stats()))
            .collect();
        stats.sort_by_key(|(kind, _)| *kind);
        stats
    }

    /// Force the kind's breaker closed. Returns `false` if it was never created.
    pub fn reset_breaker(&self, kind: OperationKind) -> bool {
        match self.breakers.get(&kind) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Invoke `f` up to `max_attempts` times for `kind`.
    ///
    /// Permission, not-found and internal failures propagate after one
    /// invocation. Rate-limit hints are honoured (capped) without advancing
    /// the backoff exponent. Other remote failures back off exponentially.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::BreakerOpen`] as soon as the breaker rejects an
    /// attempt; otherwise the last [`ExecutionError::Remote`] once attempts
    /// run out or a non-retryable failure occurs.
    pub async fn execute_with_retry<F, Fut, T>(&self, kind: OperationKind, mut f: F) -> Result<T, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let policy = self.policies.retry(kind);
        let breaker = self.breaker(kind);
        let mut attempt = 0_u32;
        let mut step = 0_u32;

        loop {
            attempt += 1;
            let err = match breaker.call(|| f()).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(%kind, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(BreakerError::Open { kind, retry_in }) => {
                    warn!(
                        %kind,
                        attempt,
                        retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                        "circuit open, not attempting"
                    );
                    return Err(ExecutionError::BreakerOpen { kind });
                }
                Err(BreakerError::Call(err)) => err,
            };

            if !err.class.is_retryable() {
                debug!(%kind, attempt, error = %err, "non-retryable failure");
                return Err(err.into());
            }
            if attempt >= policy.max_attempts {
                warn!(%kind, attempts = attempt, error = %err, "retries exhausted");
                return Err(err.into());
            }

            let delay = match err.class {
                FailureClass::RateLimited {
                    retry_after: Some(after),
                } => rate_limit_delay(&policy, after),
                _ => {
                    let delay = backoff_delay(&policy, step);
                    step += 1;
                    delay
                }
            };
            debug!(
                %kind,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::resilience::policy::{BreakerConfig, RetryConfig};
    use crate::resilience::CircuitState;

    fn handler(kind: OperationKind, config: RetryConfig) -> RetryHandler {
        let policies = PolicyRegistry::new().with_retry(kind, config).unwrap();
        RetryHandler::new(Arc::new(policies))
    }

    fn fast_policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds() {
        let retry = handler(OperationKind::Warn, fast_policy(3));
        let calls = AtomicU32::new(0);

        let value = retry
            .execute_with_retry(OperationKind::Warn, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::server(502, "bad gateway"))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_failure_is_not_retried() {
        let retry = handler(OperationKind::Ban, fast_policy(5));
        let calls = AtomicU32::new(0);

        let err = retry
            .execute_with_retry(OperationKind::Ban, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::permission("missing ban_members"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ExecutionError::Remote(RemoteError { class: FailureClass::Permission, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let retry = handler(OperationKind::Note, fast_policy(2));
        let calls = AtomicU32::new(0);

        let err = retry
            .execute_with_retry(OperationKind::Note, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::server(500, format!("failure {n}")))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, ExecutionError::Remote(ref e) if e.message == "failure 1"));
    }

    async fn invocations_until_failure(retry: &RetryHandler, kind: OperationKind, failure: RemoteError) -> u32 {
        let calls = AtomicU32::new(0);
        let err = retry
            .execute_with_retry(kind, || {
                calls.fetch_add(1, Ordering::SeqCst);
                let failure = failure.clone();
                async move { Err::<(), _>(failure) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Remote(ref e) if e.class == failure.class));
        calls.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_failure_backs_off_until_exhausted() {
        let retry = handler(OperationKind::Warn, fast_policy(3));
        let started = Instant::now();

        let calls = invocations_until_failure(
            &retry,
            OperationKind::Warn,
            RemoteError::new(FailureClass::Unclassified, "connection reset"),
        )
        .await;

        assert_eq!(calls, 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_hint_uses_backoff() {
        let retry = handler(OperationKind::Warn, fast_policy(3));
        let started = Instant::now();

        let calls =
            invocations_until_failure(&retry, OperationKind::Warn, RemoteError::rate_limited(None, "slow down")).await;

        assert_eq!(calls, 3);
        // 100ms then 200ms, same as any other backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_retried() {
        let retry = handler(OperationKind::Unban, fast_policy(3));
        let started = Instant::now();

        let calls =
            invocations_until_failure(&retry, OperationKind::Unban, RemoteError::not_found("unknown ban")).await;

        assert_eq!(calls, 1);
        assert!(started.elapsed() < Duration::from_millis(1));
        assert_eq!(retry.breaker(OperationKind::Unban).stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn internal_failure_propagates_uncounted() {
        let retry = handler(OperationKind::Note, fast_policy(3));

        let calls =
            invocations_until_failure(&retry, OperationKind::Note, RemoteError::internal("serializer bug")).await;

        assert_eq!(calls, 1);
        let stats = retry.breaker(OperationKind::Note).stats();
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_between_attempts() {
        let retry = handler(OperationKind::Warn, fast_policy(3));
        let started = Instant::now();

        let _ = retry
            .execute_with_retry(OperationKind::Warn, || async { Err::<(), _>(RemoteError::server(503, "down")) })
            .await;

        // 100ms then 200ms.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_is_honoured_without_advancing_backoff() {
        let retry = handler(OperationKind::Warn, fast_policy(4));
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        retry
            .execute_with_retry(OperationKind::Warn, || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(RemoteError::rate_limited(Some(Duration::from_millis(750)), "slow down")),
                    1 => Err(RemoteError::server(500, "oops")),
                    _ => Ok(()),
                }
            })
            .await
            .unwrap();

        // 750ms hint, then the first backoff step (100ms).
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(850) && elapsed < Duration::from_millis(860));
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_is_never_retried() {
        let config = RetryConfig {
            breaker: BreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
            },
            ..fast_policy(5)
        };
        let retry = handler(OperationKind::Kick, config);
        let calls = AtomicU32::new(0);

        let err = retry
            .execute_with_retry(OperationKind::Kick, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RemoteError::server(500, "down"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::BreakerOpen { kind: OperationKind::Kick }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err = retry
            .execute_with_retry(OperationKind::Kick, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::BreakerOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(retry.breaker(OperationKind::Kick).state(), CircuitState::Open);
        assert!(retry.reset_breaker(OperationKind::Kick));
        assert_eq!(retry.breaker(OperationKind::Kick).state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn breakers_are_per_kind_and_listed() {
        let retry = RetryHandler::new(Arc::new(PolicyRegistry::new()));
        assert!(!retry.reset_breaker(OperationKind::Purge));

        retry.breaker(OperationKind::Purge);
        retry.breaker(OperationKind::Ban);
        assert!(Arc::ptr_eq(&retry.breaker(OperationKind::Ban), &retry.breaker(OperationKind::Ban)));

        let stats = retry.breaker_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].0, OperationKind::Ban);
        assert_eq!(stats[0].1.failure_threshold, 3);
        assert_eq!(stats[1].1.failure_threshold, 10);
    }
}
