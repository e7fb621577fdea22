//! Integration tests for the quarantine and compensation-failure paths.

use std::sync::{Arc, Mutex};

use common::UserId;
use job_queue::{InMemoryJobQueue, JobState};
use kv_store::InMemoryKvStore;
use orchestrator::{
    FnStep, OrchestratorConfig, Priority, SagaCoordinator, SagaError, SagaWorker, StepRegistry,
};
use serde_json::json;

struct TestHarness {
    coordinator: SagaCoordinator<InMemoryJobQueue, InMemoryKvStore>,
    worker: SagaWorker<InMemoryJobQueue, InMemoryKvStore>,
    queue: InMemoryJobQueue,
}

impl TestHarness {
    fn new() -> Self {
        let queue = InMemoryJobQueue::new();
        let kv = InMemoryKvStore::new();
        let config = OrchestratorConfig::default();

        let coordinator = SagaCoordinator::new(queue.clone(), kv.clone(), config.clone());
        let worker = SagaWorker::new(queue.clone(), kv, StepRegistry::new(), config);

        Self {
            coordinator,
            worker,
            queue,
        }
    }

    fn steps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }
}

#[tokio::test]
async fn unregistered_step_quarantines_as_retryable() {
    let h = TestHarness::new();
    // "missing_step" is deliberately never registered.

    let job_id = h
        .coordinator
        .execute(
            UserId::new(42),
            TestHarness::steps(&["missing_step"]),
            None,
            None,
        )
        .await
        .unwrap();

    let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
    assert!(matches!(outcome, Err(SagaError::StepFunctionNotFound(_))));

    let stats = h.worker.quarantine().stats().await.unwrap();
    assert_eq!(stats.total_active, 1);
    assert_eq!(stats.high_priority, 1);

    let retryable = h.worker.quarantine().get_retryable().await.unwrap();
    assert_eq!(retryable.len(), 1);
    let record = &retryable[0];
    assert_eq!(record.original_job_id, job_id);
    assert!(record.failure_reason.contains("Step function not found"));
    assert_eq!(record.priority, Priority::High);
    assert!(record.can_retry);
    assert_eq!(record.failed_step.as_deref(), Some("missing_step"));
}

#[tokio::test]
async fn generic_step_error_quarantines_as_terminal() {
    let h = TestHarness::new();
    h.worker.registry().register(
        "validate",
        FnStep::new(|_| Box::pin(async { Ok(json!({"ok": true})) }))
            .with_compensation(|_| Box::pin(async { Ok(()) })),
    );
    h.worker.registry().register(
        "explode",
        FnStep::new(|_| Box::pin(async { Err(SagaError::step("boom")) })),
    );

    h.coordinator
        .execute(
            UserId::new(1),
            TestHarness::steps(&["validate", "explode"]),
            None,
            None,
        )
        .await
        .unwrap();

    let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
    assert!(outcome.is_err());

    let stats = h.worker.quarantine().stats().await.unwrap();
    assert_eq!(stats.total_active, 1);
    assert_eq!(stats.high_priority, 0);

    let active = h.worker.quarantine().get_all_active().await.unwrap();
    let record = &active[0];
    assert_eq!(record.priority, Priority::Normal);
    assert!(!record.can_retry);
    assert_eq!(record.user_id, UserId::new(1));
    assert_eq!(record.completed_steps, vec!["validate"]);
    assert_eq!(record.failed_step.as_deref(), Some("explode"));
    assert!(h.worker.quarantine().get_retryable().await.unwrap().is_empty());
}

#[tokio::test]
async fn terminal_business_errors_are_normal_priority() {
    let h = TestHarness::new();
    h.worker.registry().register(
        "charge",
        FnStep::new(|_| {
            Box::pin(async { Err(SagaError::step("insufficient balance for purchase")) })
        }),
    );

    h.coordinator
        .execute(UserId::new(2), TestHarness::steps(&["charge"]), None, None)
        .await
        .unwrap();
    h.worker.run_once().await.unwrap();

    let active = h.worker.quarantine().get_all_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].priority, Priority::Normal);
    assert!(!active[0].can_retry);
}

#[tokio::test]
async fn transient_step_errors_are_high_priority() {
    let h = TestHarness::new();
    h.worker.registry().register(
        "call_provider",
        FnStep::new(|_| Box::pin(async { Err(SagaError::step("upstream request timed out")) })),
    );

    h.coordinator
        .execute(
            UserId::new(2),
            TestHarness::steps(&["call_provider"]),
            None,
            None,
        )
        .await
        .unwrap();
    h.worker.run_once().await.unwrap();

    let high = h.worker.quarantine().get_high_priority().await.unwrap();
    assert_eq!(high.len(), 1);
    assert!(high[0].can_retry);
}

#[tokio::test]
async fn handled_records_leave_the_active_set() {
    let h = TestHarness::new();
    h.worker.registry().register(
        "explode",
        FnStep::new(|_| Box::pin(async { Err(SagaError::step("boom")) })),
    );

    h.coordinator
        .execute(UserId::new(3), TestHarness::steps(&["explode"]), None, None)
        .await
        .unwrap();
    h.worker.run_once().await.unwrap();

    let id = h.worker.quarantine().get_all_active().await.unwrap()[0].id;
    assert!(
        h.worker
            .quarantine()
            .mark_handled(id, "refunded manually")
            .await
            .unwrap()
    );

    let stats = h.worker.quarantine().stats().await.unwrap();
    assert_eq!(stats.total_active, 0);
    assert_eq!(stats.total_processed, 1);

    let record = h.worker.quarantine().get(id).await.unwrap().unwrap();
    assert!(record.processed_at.is_some());
    assert_eq!(record.processor_note.as_deref(), Some("refunded manually"));
}

#[tokio::test]
async fn failed_job_is_not_redelivered() {
    let h = TestHarness::new();
    h.worker.registry().register(
        "explode",
        FnStep::new(|_| Box::pin(async { Err(SagaError::step("boom")) })),
    );

    let job_id = h
        .coordinator
        .execute(UserId::new(4), TestHarness::steps(&["explode"]), None, None)
        .await
        .unwrap();
    h.worker.run_once().await.unwrap();

    // Single-attempt policy: the job is terminally failed, not re-queued.
    let status = h.coordinator.get_status(job_id).await.unwrap();
    assert_eq!(status.queue_state, JobState::Failed);
    assert_eq!(h.queue.waiting_count().await, 0);
    assert!(h.worker.run_once().await.unwrap().is_none());

    // And exactly one quarantine record exists for it.
    assert_eq!(h.worker.quarantine().stats().await.unwrap().total_active, 1);
}

#[tokio::test]
async fn compensation_failure_is_recorded_and_operator_retryable() {
    let h = TestHarness::new();

    // First step succeeds but its compensation fails transiently until the
    // flaky dependency recovers.
    let healthy = Arc::new(Mutex::new(false));
    let healthy_probe = healthy.clone();
    let undone = Arc::new(Mutex::new(Vec::<String>::new()));
    let undone_probe = undone.clone();

    h.worker.registry().register(
        "reserve",
        FnStep::new(|_| Box::pin(async { Ok(json!({"reservation_id": "RES-7"})) }))
            .with_compensation(move |result| {
                let healthy = healthy_probe.clone();
                let undone = undone_probe.clone();
                Box::pin(async move {
                    if !*healthy.lock().unwrap() {
                        return Err(SagaError::step("cache connection refused"));
                    }
                    undone
                        .lock()
                        .unwrap()
                        .push(result["reservation_id"].as_str().unwrap().to_string());
                    Ok(())
                })
            }),
    );
    h.worker.registry().register(
        "explode",
        FnStep::new(|_| Box::pin(async { Err(SagaError::step("boom")) })),
    );

    h.coordinator
        .execute(
            UserId::new(5),
            TestHarness::steps(&["reserve", "explode"]),
            None,
            None,
        )
        .await
        .unwrap();

    let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
    // The compensation failure did not change the saga outcome.
    assert!(matches!(outcome, Err(SagaError::StepExecution { .. })));

    let failures = h.worker.compensation().list_failures().await.unwrap();
    assert_eq!(failures.len(), 1);
    let failure = &failures[0];
    assert_eq!(failure.step_name, "reserve");
    assert!(failure.retryable);
    assert_eq!(failure.step_result, json!({"reservation_id": "RES-7"}));

    // The dependency recovers; the operator retries the compensation.
    *healthy.lock().unwrap() = true;
    h.worker
        .compensation()
        .retry_failure(&failure.key, h.worker.registry())
        .await
        .unwrap();

    assert_eq!(*undone.lock().unwrap(), vec!["RES-7"]);
    assert!(h.worker.compensation().list_failures().await.unwrap().is_empty());
}
