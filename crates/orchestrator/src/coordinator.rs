//! Saga coordinator: the external API for starting sagas and querying them.

use chrono::{DateTime, Utc};
use common::{JobId, UserId};
use job_queue::{EnqueueOptions, JobQueue, JobState};
use kv_store::KvStore;
use serde_json::Value;

use crate::config::OrchestratorConfig;
use crate::error::{Result, SagaError};
use crate::job::{ResourceIdentifier, SagaJob};

fn idempotency_key(key: &str) -> String {
    format!("idempotent:{key}")
}

/// Queue-level status of a saga job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub id: JobId,
    pub queue_state: JobState,
    pub progress: u8,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    /// The saga payload as currently persisted.
    pub data: Value,
}

/// Accepts saga definitions, enforces idempotency, and enqueues jobs.
///
/// Sagas are enqueued with an attempt budget of 1 by default: retries of
/// failed sagas are operator-driven requeues of quarantined records, never
/// blind queue redelivery.
pub struct SagaCoordinator<Q, K>
where
    Q: JobQueue,
    K: KvStore,
{
    queue: Q,
    kv: K,
    config: OrchestratorConfig,
}

impl<Q, K> SagaCoordinator<Q, K>
where
    Q: JobQueue,
    K: KvStore,
{
    /// Creates a new coordinator.
    pub fn new(queue: Q, kv: K, config: OrchestratorConfig) -> Self {
        Self { queue, kv, config }
    }

    /// Starts a saga for `user_id` over the named steps.
    ///
    /// When `resources` is None the saga locks the user itself. When an
    /// idempotency key is supplied and already bound, the bound job ID is
    /// returned without enqueueing a second job.
    #[tracing::instrument(skip(self, step_names), fields(steps = step_names.len()))]
    pub async fn execute(
        &self,
        user_id: UserId,
        step_names: Vec<String>,
        resources: Option<Vec<ResourceIdentifier>>,
        idempotency_key_value: Option<String>,
    ) -> Result<JobId> {
        metrics::counter!("saga_executions_total").increment(1);

        if step_names.is_empty() {
            return Err(SagaError::NoSteps);
        }

        if let Some(key) = &idempotency_key_value
            && let Some(bound) = self.kv.get(&idempotency_key(key)).await?
            && let Ok(job_id) = bound.parse::<JobId>()
        {
            tracing::info!(%job_id, key, "idempotency hit, returning existing job");
            return Ok(job_id);
        }

        let resources =
            resources.unwrap_or_else(|| vec![ResourceIdentifier::for_user(user_id)]);
        let saga = SagaJob::new(
            user_id,
            step_names,
            resources,
            idempotency_key_value.clone(),
        );

        let job_id = self
            .queue
            .enqueue(
                serde_json::to_value(&saga)?,
                EnqueueOptions::with_attempts(self.config.queue_attempts),
            )
            .await?;

        if let Some(key) = &idempotency_key_value {
            self.kv
                .set_ex(
                    &idempotency_key(key),
                    &job_id.to_string(),
                    self.config.idempotency_ttl,
                )
                .await?;
        }

        tracing::info!(%job_id, %user_id, "saga enqueued");
        Ok(job_id)
    }

    /// Returns the queue-level status of a saga job.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatus> {
        let job = self
            .queue
            .fetch(job_id)
            .await?
            .ok_or(SagaError::JobNotFound(job_id))?;

        Ok(JobStatus {
            id: job.id,
            queue_state: job.state,
            progress: job.progress,
            processed_on: job.processed_on,
            finished_on: job.finished_on,
            failed_reason: job.failed_reason,
            data: job.payload,
        })
    }
}
