//! Saga worker: drives the per-job state machine.
//!
//! One invocation runs `ENTERING → LOCK_ACQUIRED → EXECUTING(i) →
//! COMPLETED`, branching to compensation and quarantine on failure. Each
//! step's status is checkpointed before its side effects and committed
//! after them: on a crash between the two the step is retried exactly once
//! more, on a crash after the commit it never re-runs. Resume falls out of
//! that: redelivery of the same job replays nothing and continues at
//! `current_step_index`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use common::JobId;
use job_queue::{Job, JobQueue};
use kv_store::KvStore;
use serde_json::Value;

use crate::classify::ClassificationTable;
use crate::compensation::{CompensationEngine, TrailEntry};
use crate::config::OrchestratorConfig;
use crate::error::{Result, SagaError};
use crate::job::{ResourceIdentifier, SagaJob};
use crate::lock::LockManager;
use crate::quarantine::{QuarantineRecord, QuarantineStore};
use crate::registry::StepRegistry;
use crate::step::{StepContext, StepStatus};

/// Outcome of a successful saga run.
#[derive(Debug, Clone)]
pub struct SagaRunSummary {
    /// Steps executed by this invocation, in order.
    pub executed_steps: Vec<String>,

    /// Wall-clock duration of the invocation.
    pub duration: Duration,

    /// Step results by name, including steps completed by earlier
    /// invocations of the same job.
    pub results: HashMap<String, Value>,
}

/// Dequeues saga jobs and executes their steps under the resource lock.
pub struct SagaWorker<Q, K>
where
    Q: JobQueue,
    K: KvStore + Clone,
{
    queue: Q,
    registry: StepRegistry,
    locks: LockManager<K>,
    compensation: CompensationEngine<K>,
    quarantine: QuarantineStore<K>,
    classifier: ClassificationTable,
    config: OrchestratorConfig,
}

impl<Q, K> SagaWorker<Q, K>
where
    Q: JobQueue,
    K: KvStore + Clone,
{
    /// Creates a worker over the given queue, kv service, and registry.
    pub fn new(queue: Q, kv: K, registry: StepRegistry, config: OrchestratorConfig) -> Self {
        Self {
            queue,
            registry,
            locks: LockManager::new(kv.clone(), config.lock_ttl),
            compensation: CompensationEngine::new(kv.clone(), config.compensation_retention),
            quarantine: QuarantineStore::new(kv),
            classifier: ClassificationTable::saga_defaults(),
            config,
        }
    }

    /// The step registry this worker resolves names against.
    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// The quarantine store this worker writes terminal failures to.
    pub fn quarantine(&self) -> &QuarantineStore<K> {
        &self.quarantine
    }

    /// The compensation engine, for operator retry of recorded failures.
    pub fn compensation(&self) -> &CompensationEngine<K> {
        &self.compensation
    }

    /// Leases the next waiting job, processes it, and settles its queue
    /// state. Returns None when the queue is empty.
    pub async fn run_once(&self) -> Result<Option<(JobId, Result<SagaRunSummary>)>> {
        let Some(job) = self.queue.take_next().await? else {
            return Ok(None);
        };

        let outcome = self.process(&job).await;
        match &outcome {
            Ok(summary) => {
                self.queue
                    .complete(
                        job.id,
                        serde_json::json!({
                            "success": true,
                            "executed_steps": summary.executed_steps,
                            "duration_ms": summary.duration.as_millis() as u64,
                        }),
                    )
                    .await?;
            }
            Err(err) => {
                self.queue.fail(job.id, &err.to_string()).await?;
            }
        }
        Ok(Some((job.id, outcome)))
    }

    /// Runs the state machine for one delivered job.
    ///
    /// On failure the error propagates to the caller (and thus the queue)
    /// after the quarantine record is written, so attempt counting reflects
    /// reality.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn process(&self, job: &Job) -> Result<SagaRunSummary> {
        let started = Instant::now();
        let mut saga: SagaJob = serde_json::from_value(job.payload.clone())?;

        let outcome = self.run(job, &mut saga, started).await;
        if let Err(err) = &outcome {
            self.quarantine_if_final(job, &saga, err).await;
        }
        outcome
    }

    async fn run(
        &self,
        job: &Job,
        saga: &mut SagaJob,
        started: Instant,
    ) -> Result<SagaRunSummary> {
        // ENTERING: serialize on the declared resources.
        let resources = saga.resources_or_default();
        if !self
            .locks
            .acquire(&resources, job.id, self.config.lock_ttl)
            .await?
        {
            // Locks taken by the other saga stay untouched; nothing of ours
            // to release since acquisition rolled itself back.
            return Err(SagaError::ResourceBusy(describe(&resources)));
        }

        let outcome = self.run_locked(job, saga, started).await;

        // Owner-verified release is safe on every exit path; if our TTL
        // already expired it simply deletes nothing.
        if let Err(e) = self.locks.release(&resources, job.id).await {
            tracing::warn!(error = %e, "lock release failed; TTL will reap the keys");
        }

        outcome
    }

    async fn run_locked(
        &self,
        job: &Job,
        saga: &mut SagaJob,
        started: Instant,
    ) -> Result<SagaRunSummary> {
        let total = saga.steps.len();
        if total == 0 {
            return Err(SagaError::NoSteps);
        }

        // LOCK_ACQUIRED: rebuild the success trail from persisted state so
        // steps completed by earlier invocations can still be compensated.
        let mut results: HashMap<String, Value> = HashMap::new();
        let mut trail: Vec<TrailEntry> = Vec::new();
        for state in saga.steps.iter().take(saga.current_step_index.min(total)) {
            if state.status != StepStatus::Completed {
                continue;
            }
            let result = state.result.clone().unwrap_or(Value::Null);
            results.insert(state.name.clone(), result.clone());
            match self.registry.get(&state.name) {
                Some(handler) => trail.push(TrailEntry {
                    name: state.name.clone(),
                    result,
                    handler,
                }),
                // Deploy skew: this node cannot roll the step back. A node
                // that has the step will, on operator requeue.
                None => tracing::warn!(
                    step = %state.name,
                    "completed step missing from registry; its compensation is unavailable on this node"
                ),
            }
        }

        let mut executed = Vec::new();

        for i in saga.current_step_index..total {
            self.queue
                .update_progress(job.id, ((i * 100) / total) as u8)
                .await?;

            // Checkpoint in_progress before the step's side effects.
            saga.steps[i].status = StepStatus::InProgress;
            if saga.current_step_index < i {
                saga.current_step_index = i;
            }
            self.checkpoint(job.id, saga).await?;

            let name = saga.steps[i].name.clone();
            let Some(handler) = self.registry.get(&name) else {
                saga.steps[i].status = StepStatus::Failed;
                self.checkpoint(job.id, saga).await?;
                // No compensation: the step may be re-added on the next
                // deploy, and the job stays resumable from this index.
                return Err(SagaError::StepFunctionNotFound(name));
            };

            tracing::info!(step = %name, index = i, "saga step started");
            let ctx = StepContext {
                job_id: job.id,
                user_id: saga.user_id,
                results: results.clone(),
            };

            match handler.execute(&ctx).await {
                Ok(result) => {
                    // Commit after the side effects: the step never re-runs.
                    saga.steps[i].status = StepStatus::Completed;
                    saga.steps[i].result = Some(result.clone());
                    if i + 1 < total {
                        saga.current_step_index = i + 1;
                    }
                    self.checkpoint(job.id, saga).await?;

                    results.insert(name.clone(), result.clone());
                    trail.push(TrailEntry {
                        name: name.clone(),
                        result,
                        handler,
                    });
                    executed.push(name);
                }
                Err(err) => {
                    saga.steps[i].status = StepStatus::Failed;
                    self.checkpoint(job.id, saga).await?;

                    let report = self.compensation.run(job.id, &trail).await;
                    metrics::counter!("saga_failed").increment(1);
                    tracing::warn!(
                        step = %name,
                        error = %err,
                        compensated = report.compensated.len(),
                        failed_compensations = report.failed.len(),
                        "saga step failed; completed steps compensated in reverse"
                    );

                    return Err(SagaError::StepExecution {
                        step: name,
                        reason: err.to_string(),
                    });
                }
            }
        }

        // COMPLETED.
        self.queue.update_progress(job.id, 100).await?;
        let duration = started.elapsed();
        metrics::histogram!("saga_duration_seconds").record(duration.as_secs_f64());
        metrics::counter!("saga_completed").increment(1);
        tracing::info!(steps = executed.len(), ?duration, "saga completed");

        Ok(SagaRunSummary {
            executed_steps: executed,
            duration,
            results,
        })
    }

    async fn checkpoint(&self, job_id: JobId, saga: &SagaJob) -> Result<()> {
        self.queue
            .update_payload(job_id, serde_json::to_value(saga)?)
            .await?;
        Ok(())
    }

    /// Writes the quarantine record once this delivery is the job's last.
    ///
    /// A write failure is logged at error level and swallowed: the saga
    /// failure itself must still propagate to the queue.
    async fn quarantine_if_final(&self, job: &Job, saga: &SagaJob, err: &SagaError) {
        let attempt = job.attempts_made.max(1);
        if attempt < job.max_attempts {
            tracing::debug!(attempt, max_attempts = job.max_attempts, "attempts remain, queue will redeliver");
            return;
        }

        let kind = self.classifier.classify(&err.to_string());
        let record = QuarantineRecord::from_failure(job.id, saga, err, kind);
        match self.quarantine.add_once(job.id, attempt, record).await {
            Ok(Some(id)) => {
                tracing::warn!(quarantine_id = %id, "saga moved to quarantine");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "FATAL: quarantine write failed; record lost, failure still propagates");
            }
        }
    }
}

fn describe(resources: &[ResourceIdentifier]) -> String {
    resources
        .iter()
        .map(|r| r.describe())
        .collect::<Vec<_>>()
        .join(", ")
}
