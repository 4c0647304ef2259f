//! End-to-end behaviour of the executor through its public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modguard_core::{ActorId, AuditOutcome, OperationKind, RemoteError, SubjectId};
use modguard_executor::{
    BreakerConfig, CaseDraft, CaseRecorder, CircuitState, ErrorCategory, ExecutionError, ExecutorConfig,
    HealthStatus, LockConfig, ModerationAction, ModerationExecutor, PolicyRegistry, RetryConfig, TimeoutConfig,
};
use parking_lot::Mutex;
use tokio::time::Instant;

fn ok_after(delay_ms: u64, log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> ModerationAction {
    ModerationAction::new(OperationKind::Timeout, SubjectId(42), ActorId(1), move || {
        let log = Arc::clone(&log);
        async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.lock().push(name);
            Ok(serde_json::json!(name))
        }
    })
}

#[tokio::test(start_paused = true)]
async fn same_subject_actions_complete_in_arrival_order() {
    let executor = Arc::new(ModerationExecutor::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let spawn = |action: ModerationAction| {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(action).await })
    };

    let a = spawn(ok_after(200, Arc::clone(&log), "A"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let b = spawn(ok_after(5, Arc::clone(&log), "B"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let c = spawn(ok_after(5, Arc::clone(&log), "C"));
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(executor.locks().queue_len(SubjectId(42)), 2);

    for handle in [a, b, c] {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(*log.lock(), vec!["A", "B", "C"]);
    assert_eq!(executor.locks().queue_len(SubjectId(42)), 0);

    let report = executor.monitor().get_all_metrics();
    assert_eq!(report.lock_contention, 2);
    assert_eq!(report.operations[&OperationKind::Timeout].successes, 3);
}

#[tokio::test(start_paused = true)]
async fn overflowing_a_subject_queue_fails_fast_and_is_audited() {
    let executor = Arc::new(
        ModerationExecutor::builder()
            .config(ExecutorConfig {
                lock: LockConfig {
                    queue_capacity: 1,
                    ..LockConfig::default()
                },
                ..ExecutorConfig::default()
            })
            .build(),
    );
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for name in ["A", "B"] {
        let executor = Arc::clone(&executor);
        let action = ok_after(100, Arc::clone(&log), name);
        handles.push(tokio::spawn(async move { executor.execute(action).await }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let err = executor
        .execute(ok_after(1, Arc::clone(&log), "C"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Overload);
    assert_eq!(err.tag(), "queue_full");

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(*log.lock(), vec!["A", "B"]);

    let failures: Vec<_> = executor
        .monitor()
        .audit_events_for_subject(SubjectId(42))
        .into_iter()
        .filter(|e| e.outcome == AuditOutcome::Failure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.as_deref().unwrap().starts_with("queue_full"));
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_then_recovers_after_one_trial_call() {
    let policies = PolicyRegistry::new()
        .with_retry(
            OperationKind::Ban,
            RetryConfig {
                max_attempts: 1,
                breaker: BreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout: Duration::from_secs(60),
                },
                ..RetryConfig::for_kind(OperationKind::Ban)
            },
        )
        .unwrap();
    let executor = ModerationExecutor::builder().policies(policies).build();

    let calls = Arc::new(AtomicU32::new(0));
    let healthy = Arc::new(AtomicU32::new(0));
    let ban = |subject: u64| {
        let calls = Arc::clone(&calls);
        let healthy = Arc::clone(&healthy);
        ModerationAction::new(OperationKind::Ban, SubjectId(subject), ActorId(1), move || {
            let calls = Arc::clone(&calls);
            let healthy = Arc::clone(&healthy);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if healthy.load(Ordering::SeqCst) == 1 {
                    Ok(serde_json::Value::Null)
                } else {
                    Err(RemoteError::server(500, "internal server error"))
                }
            }
        })
    };

    for subject in 1..=3 {
        let err = executor.execute(ban(subject)).await.unwrap_err();
        assert_eq!(err.tag(), "server");
    }
    assert_eq!(executor.retry().breaker(OperationKind::Ban).state(), CircuitState::Open);

    let started = Instant::now();
    let err = executor.execute(ban(4)).await.unwrap_err();
    assert!(matches!(err, ExecutionError::BreakerOpen { kind: OperationKind::Ban }));
    assert!(started.elapsed() < Duration::from_millis(1));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_secs(60)).await;
    healthy.store(1, Ordering::SeqCst);
    executor.execute(ban(5)).await.unwrap();

    let breaker = executor.retry().breaker(OperationKind::Ban);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.stats().consecutive_failures, 0);
    assert_eq!(executor.monitor().get_all_metrics().breaker_trips[&OperationKind::Ban], 1);
    assert_eq!(executor.monitor().get_system_health().status, HealthStatus::Unhealthy);
}

#[tokio::test(start_paused = true)]
async fn slow_remote_recovers_within_extended_deadline() {
    let policies = PolicyRegistry::new()
        .with_timeout(
            OperationKind::RoleUpdate,
            TimeoutConfig {
                operation_timeout: Duration::from_millis(100),
                max_extend_attempts: 2,
                extend_factor: 1.5,
                ..TimeoutConfig::for_kind(OperationKind::RoleUpdate)
            },
        )
        .unwrap();
    let executor = ModerationExecutor::builder().policies(policies).build();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let action = ModerationAction::new(OperationKind::RoleUpdate, SubjectId(7), ActorId(2), move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(130)).await;
            Ok(serde_json::json!({ "roles": ["muted"] }))
        }
    });

    let outcome = executor.execute(action).await.unwrap();
    assert_eq!(outcome.result["roles"][0], "muted");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

struct RecordingCases {
    drafts: Mutex<Vec<CaseDraft>>,
}

#[async_trait]
impl CaseRecorder for RecordingCases {
    async fn record_case(&self, draft: CaseDraft) -> anyhow::Result<u64> {
        let mut drafts = self.drafts.lock();
        drafts.push(draft);
        Ok(drafts.len() as u64)
    }
}

#[tokio::test]
async fn successful_action_writes_case_and_audit() {
    let cases = Arc::new(RecordingCases {
        drafts: Mutex::new(Vec::new()),
    });
    let executor = ModerationExecutor::builder()
        .case_recorder(Arc::clone(&cases) as Arc<dyn CaseRecorder>)
        .build();

    let action = ModerationAction::new(OperationKind::Softban, SubjectId(99), ActorId(4), || async {
        Ok(serde_json::json!({ "deleted_messages": 12 }))
    })
    .with_reason("spam wave")
    .with_case_record();

    let outcome = executor.execute(action).await.unwrap();
    assert_eq!(outcome.case_id, Some(1));

    let drafts = cases.drafts.lock();
    assert_eq!(drafts[0].reason.as_deref(), Some("spam wave"));
    assert_eq!(drafts[0].remote_result["deleted_messages"], 12);

    let audit = executor.monitor().audit_events_for_subject(SubjectId(99));
    assert_eq!(audit.len(), 1);
    assert!(audit[0].case_recorded);
    assert_eq!(audit[0].reason.as_deref(), Some("spam wave"));
}

#[tokio::test]
async fn clearing_old_data_keeps_per_kind_totals() {
    let executor = ModerationExecutor::new();
    executor.monitor().record_lock_contention();
    executor.monitor().record_circuit_breaker_trip(OperationKind::Kick);

    let action = ModerationAction::new(OperationKind::Warn, SubjectId(1), ActorId(1), || async {
        Ok(serde_json::Value::Null)
    });
    executor.execute(action).await.unwrap();

    executor.monitor().clear_old_data(24);
    let report = executor.monitor().get_all_metrics();
    assert_eq!(report.lock_contention, 0);
    assert!(report.breaker_trips.is_empty());
    assert_eq!(report.operations[&OperationKind::Warn].total, 1);
    assert_eq!(report.audit_events, 1);
}

#[tokio::test(start_paused = true)]
async fn abandoned_action_is_recorded_and_frees_its_subject() {
    let executor = ModerationExecutor::new();
    let stalled = ModerationAction::new(OperationKind::Warn, SubjectId(5), ActorId(3), || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(serde_json::Value::Null)
    });

    let waited = tokio::time::timeout(Duration::from_millis(10), executor.execute(stalled)).await;
    assert!(waited.is_err());
    tokio::time::sleep(Duration::from_secs(60)).await;

    let health = executor.monitor().get_system_health();
    assert_eq!(health.in_flight, 0);
    assert_eq!(health.total_operations, 1);
    assert_eq!(health.audit_events, 1);
    assert!(!executor.locks().is_locked(SubjectId(5)));

    let follow_up = ModerationAction::new(OperationKind::Note, SubjectId(5), ActorId(3), || async {
        Ok(serde_json::Value::Null)
    });
    executor.execute(follow_up).await.unwrap();
}
