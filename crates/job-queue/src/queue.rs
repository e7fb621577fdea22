use async_trait::async_trait;
use common::JobId;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{Job, Result};

/// Options for enqueueing a job.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Attempt budget for the job. Defaults to 1: a saga is never blindly
    /// retried by the queue; recovery goes through the quarantine instead.
    pub attempts: u32,
}

impl EnqueueOptions {
    /// Creates options with the given attempt budget.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { attempts: 1 }
    }
}

/// Queue lifecycle notifications, delivered to all subscribers.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A job finished successfully.
    Completed { job_id: JobId, result: Value },

    /// A job exhausted its attempts and failed terminally.
    Failed { job_id: JobId, reason: String },

    /// A job reported progress.
    Progress { job_id: JobId, progress: u8 },
}

/// Core trait for durable job queue implementations.
///
/// Required semantics: at-least-once delivery, per-job payload mutation,
/// and visibility locking: a job leased via [`take_next`](JobQueue::take_next)
/// is not delivered to another worker until it is settled with
/// [`complete`](JobQueue::complete) or [`fail`](JobQueue::fail).
/// No ordering guarantee across jobs is assumed by callers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a payload and returns the assigned job ID.
    async fn enqueue(&self, payload: Value, options: EnqueueOptions) -> Result<JobId>;

    /// Fetches a job by ID, including payload, state, and attempt count.
    async fn fetch(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Replaces the job payload in place. Required for resumability: the
    /// worker checkpoints step progress through this.
    async fn update_payload(&self, job_id: JobId, payload: Value) -> Result<()>;

    /// Records observational progress (0..=100) and emits a progress event.
    async fn update_progress(&self, job_id: JobId, progress: u8) -> Result<()>;

    /// Leases the next waiting job, marking it active and counting the
    /// delivery attempt. Returns None when no job is waiting.
    async fn take_next(&self) -> Result<Option<Job>>;

    /// Settles an active job as completed with a result.
    async fn complete(&self, job_id: JobId, result: Value) -> Result<()>;

    /// Settles an active job as failed. While attempts remain the job is
    /// re-queued for another delivery; otherwise it fails terminally and a
    /// failure event is emitted.
    async fn fail(&self, job_id: JobId, reason: &str) -> Result<()>;

    /// Subscribes to completion, failure, and progress events.
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;
}
