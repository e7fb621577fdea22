//! Integration tests for the saga orchestrator.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::UserId;
use job_queue::{InMemoryJobQueue, Job, JobQueue, JobState};
use kv_store::{InMemoryKvStore, KvStore};
use orchestrator::{
    FnStep, OrchestratorConfig, ResourceIdentifier, SagaCoordinator, SagaError, SagaJob,
    SagaWorker, StepRegistry, StepStatus,
};
use serde_json::json;

type Log = Arc<Mutex<Vec<String>>>;

struct TestHarness {
    coordinator: SagaCoordinator<InMemoryJobQueue, InMemoryKvStore>,
    worker: SagaWorker<InMemoryJobQueue, InMemoryKvStore>,
    queue: InMemoryJobQueue,
    kv: InMemoryKvStore,
    log: Log,
}

impl TestHarness {
    fn new() -> Self {
        let queue = InMemoryJobQueue::new();
        let kv = InMemoryKvStore::new();
        let config = OrchestratorConfig::default();

        let coordinator = SagaCoordinator::new(queue.clone(), kv.clone(), config.clone());
        let worker = SagaWorker::new(queue.clone(), kv.clone(), StepRegistry::new(), config);

        Self {
            coordinator,
            worker,
            queue,
            kv,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a step that logs `<name>+` on execute and `<name>-` on
    /// compensate.
    fn register_step(&self, name: &'static str) {
        let execute_log = self.log.clone();
        let compensate_log = self.log.clone();
        self.worker.registry().register(
            name,
            FnStep::new(move |_| {
                let log = execute_log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{name}+"));
                    Ok(json!({"step": name}))
                })
            })
            .with_compensation(move |_| {
                let log = compensate_log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{name}-"));
                    Ok(())
                })
            }),
        );
    }

    /// Registers a step that logs `<name>+attempt`, then fails. Its
    /// compensation logs `<name>-` so the tests can prove it never runs.
    fn register_failing_step(&self, name: &'static str, message: &'static str) {
        let execute_log = self.log.clone();
        let compensate_log = self.log.clone();
        self.worker.registry().register(
            name,
            FnStep::new(move |_| {
                let log = execute_log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{name}+attempt"));
                    Err(SagaError::step(message))
                })
            })
            .with_compensation(move |_| {
                let log = compensate_log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("{name}-"));
                    Ok(())
                })
            }),
        );
    }

    /// Registers a step that sleeps before succeeding, to make concurrent
    /// invocations overlap.
    fn register_slow_step(&self, name: &'static str, delay: Duration) {
        self.worker.registry().register(
            name,
            FnStep::new(move |_| {
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    Ok(json!({"step": name}))
                })
            })
            .with_compensation(|_| Box::pin(async { Ok(()) })),
        );
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn steps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }
}

#[tokio::test]
async fn five_step_saga_completes() {
    let h = TestHarness::new();
    for name in ["validate", "charge", "deduct", "finalize", "notify"] {
        h.register_step(name);
    }

    let job_id = h
        .coordinator
        .execute(
            UserId::new(42),
            TestHarness::steps(&["validate", "charge", "deduct", "finalize", "notify"]),
            None,
            None,
        )
        .await
        .unwrap();

    let (processed_id, outcome) = h.worker.run_once().await.unwrap().unwrap();
    assert_eq!(processed_id, job_id);

    let summary = outcome.unwrap();
    assert_eq!(
        summary.executed_steps,
        vec!["validate", "charge", "deduct", "finalize", "notify"]
    );
    assert_eq!(summary.results.len(), 5);
    assert_eq!(summary.results["charge"], json!({"step": "charge"}));

    // Queue state reflects completion.
    let status = h.coordinator.get_status(job_id).await.unwrap();
    assert_eq!(status.queue_state, JobState::Completed);
    assert_eq!(status.progress, 100);
    assert!(status.finished_on.is_some());

    // Every persisted step is completed with its result.
    let saga: SagaJob = serde_json::from_value(status.data).unwrap();
    assert!(
        saga.steps
            .iter()
            .all(|s| s.status == StepStatus::Completed && s.result.is_some())
    );

    // The lock is gone and nothing was quarantined.
    assert!(!h.kv.exists("tx_lock:user_42").await.unwrap());
    let stats = h.worker.quarantine().stats().await.unwrap();
    assert_eq!(stats.total_active, 0);
}

#[tokio::test]
async fn middle_failure_compensates_completed_steps_in_reverse() {
    let h = TestHarness::new();
    h.register_step("a");
    h.register_step("b");
    h.register_failing_step("c", "X");

    let job_id = h
        .coordinator
        .execute(UserId::new(7), TestHarness::steps(&["a", "b", "c"]), None, None)
        .await
        .unwrap();

    let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
    let err = outcome.unwrap_err();
    assert!(matches!(err, SagaError::StepExecution { ref step, .. } if step == "c"));

    // Exactly the two completed steps were compensated, newest first; the
    // failing step itself was not.
    assert_eq!(h.log(), vec!["a+", "b+", "c+attempt", "b-", "a-"]);

    let status = h.coordinator.get_status(job_id).await.unwrap();
    assert_eq!(status.queue_state, JobState::Failed);
    assert!(status.failed_reason.unwrap().contains("Step 'c' failed"));

    let saga: SagaJob = serde_json::from_value(status.data).unwrap();
    assert_eq!(saga.steps[0].status, StepStatus::Completed);
    assert_eq!(saga.steps[1].status, StepStatus::Completed);
    assert_eq!(saga.steps[2].status, StepStatus::Failed);

    // The lock was released on the failure path too.
    assert!(!h.kv.exists("tx_lock:user_7").await.unwrap());
}

#[tokio::test]
async fn concurrent_sagas_on_the_same_user_are_serialized() {
    let h = TestHarness::new();
    h.register_slow_step("hold", Duration::from_millis(250));

    let user = UserId::new(42);
    h.coordinator
        .execute(user, TestHarness::steps(&["hold"]), None, None)
        .await
        .unwrap();
    h.coordinator
        .execute(user, TestHarness::steps(&["hold"]), None, None)
        .await
        .unwrap();

    let first: Job = h.queue.take_next().await.unwrap().unwrap();
    let second: Job = h.queue.take_next().await.unwrap().unwrap();

    let (outcome_a, outcome_b) =
        tokio::join!(h.worker.process(&first), h.worker.process(&second));

    // Exactly one wins the lock; the other observes the busy failure.
    let (successes, failures): (Vec<_>, Vec<_>) =
        [outcome_a, outcome_b].into_iter().partition(|o| o.is_ok());
    assert_eq!(successes.len(), 1);
    assert_eq!(failures.len(), 1);

    let err = failures.into_iter().next().unwrap().unwrap_err();
    assert!(err.to_string().contains("other transaction in progress"));
    assert!(err.to_string().contains("user_42"));

    // The winner held the lock through its run and then released it.
    assert!(!h.kv.exists("tx_lock:user_42").await.unwrap());

    // The busy failure is quarantined as retryable.
    let stats = h.worker.quarantine().stats().await.unwrap();
    assert_eq!(stats.total_active, 1);
    assert_eq!(stats.high_priority, 1);
}

#[tokio::test]
async fn sagas_on_disjoint_resources_run_in_parallel() {
    let h = TestHarness::new();
    h.register_slow_step("hold", Duration::from_millis(250));

    h.coordinator
        .execute(UserId::new(1), TestHarness::steps(&["hold"]), None, None)
        .await
        .unwrap();
    h.coordinator
        .execute(UserId::new(2), TestHarness::steps(&["hold"]), None, None)
        .await
        .unwrap();

    let first = h.queue.take_next().await.unwrap().unwrap();
    let second = h.queue.take_next().await.unwrap().unwrap();

    let started = Instant::now();
    let (outcome_a, outcome_b) =
        tokio::join!(h.worker.process(&first), h.worker.process(&second));
    let elapsed = started.elapsed();

    assert!(outcome_a.is_ok());
    assert!(outcome_b.is_ok());

    // Serialized execution would take at least twice the step delay.
    assert!(
        elapsed < Duration::from_millis(450),
        "expected overlap, took {elapsed:?}"
    );

    assert!(!h.kv.exists("tx_lock:user_1").await.unwrap());
    assert!(!h.kv.exists("tx_lock:user_2").await.unwrap());
}

#[tokio::test]
async fn resumed_job_skips_completed_steps() {
    let h = TestHarness::new();
    for name in ["a", "b", "c", "d"] {
        h.register_step(name);
    }

    let job_id = h
        .coordinator
        .execute(
            UserId::new(5),
            TestHarness::steps(&["a", "b", "c", "d"]),
            None,
            None,
        )
        .await
        .unwrap();

    // Simulate a previous invocation that completed the first two steps
    // and crashed before finishing.
    let job = h.queue.fetch(job_id).await.unwrap().unwrap();
    let mut saga: SagaJob = serde_json::from_value(job.payload).unwrap();
    saga.steps[0].status = StepStatus::Completed;
    saga.steps[0].result = Some(json!({"step": "a", "run": "earlier"}));
    saga.steps[1].status = StepStatus::Completed;
    saga.steps[1].result = Some(json!({"step": "b", "run": "earlier"}));
    saga.current_step_index = 2;
    h.queue
        .update_payload(job_id, serde_json::to_value(&saga).unwrap())
        .await
        .unwrap();

    let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
    let summary = outcome.unwrap();

    // Only the remaining steps ran; nothing was re-executed or compensated.
    assert_eq!(summary.executed_steps, vec!["c", "d"]);
    assert_eq!(h.log(), vec!["c+", "d+"]);

    // Earlier results are still visible in the summary.
    assert_eq!(summary.results["a"], json!({"step": "a", "run": "earlier"}));

    let status = h.coordinator.get_status(job_id).await.unwrap();
    assert_eq!(status.queue_state, JobState::Completed);
}

#[tokio::test]
async fn prior_step_results_are_visible_to_later_steps() {
    let h = TestHarness::new();
    h.worker.registry().register(
        "reserve",
        FnStep::new(|_| Box::pin(async { Ok(json!({"reservation_id": "RES-1"})) }))
            .with_compensation(|_| Box::pin(async { Ok(()) })),
    );
    h.worker.registry().register(
        "confirm",
        FnStep::new(|ctx| {
            Box::pin(async move {
                let reservation = ctx
                    .result_of("reserve")
                    .and_then(|r| r["reservation_id"].as_str())
                    .map(str::to_string)
                    .ok_or_else(|| SagaError::step("reservation missing"))?;
                Ok(json!({"confirmed": reservation}))
            })
        }),
    );

    h.coordinator
        .execute(
            UserId::new(3),
            TestHarness::steps(&["reserve", "confirm"]),
            None,
            None,
        )
        .await
        .unwrap();

    let (_, outcome) = h.worker.run_once().await.unwrap().unwrap();
    let summary = outcome.unwrap();
    assert_eq!(summary.results["confirm"], json!({"confirmed": "RES-1"}));
}

#[tokio::test]
async fn idempotency_key_returns_the_same_job() {
    let h = TestHarness::new();
    h.register_step("only");

    let first = h
        .coordinator
        .execute(
            UserId::new(9),
            TestHarness::steps(&["only"]),
            None,
            Some("K".to_string()),
        )
        .await
        .unwrap();
    let second = h
        .coordinator
        .execute(
            UserId::new(9),
            TestHarness::steps(&["only"]),
            None,
            Some("K".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.queue.job_count().await, 1);

    // The binding exists with a TTL no longer than the configured hour.
    assert!(h.kv.exists("idempotent:K").await.unwrap());
    let ttl = h.kv.ttl("idempotent:K").await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(3600));
}

#[tokio::test]
async fn action_scoped_resources_do_not_collide() {
    let h = TestHarness::new();
    h.register_slow_step("hold", Duration::from_millis(150));

    // Same user, different action discriminators: disjoint lock keys.
    h.coordinator
        .execute(
            UserId::new(4),
            TestHarness::steps(&["hold"]),
            Some(vec![ResourceIdentifier::with_action("user", 4, "purchase")]),
            None,
        )
        .await
        .unwrap();
    h.coordinator
        .execute(
            UserId::new(4),
            TestHarness::steps(&["hold"]),
            Some(vec![ResourceIdentifier::with_action("user", 4, "refund")]),
            None,
        )
        .await
        .unwrap();

    let first = h.queue.take_next().await.unwrap().unwrap();
    let second = h.queue.take_next().await.unwrap().unwrap();

    let (outcome_a, outcome_b) =
        tokio::join!(h.worker.process(&first), h.worker.process(&second));
    assert!(outcome_a.is_ok());
    assert!(outcome_b.is_ok());
}
