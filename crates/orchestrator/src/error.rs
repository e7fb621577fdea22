//! Orchestrator error types.

use common::JobId;
use job_queue::QueueError;
use kv_store::KvError;
use thiserror::Error;

/// Errors that can occur during saga orchestration.
///
/// Only two error classes are recovered inside the orchestrator:
/// compensation failures (recorded and swallowed) and quarantine write
/// failures (logged). Everything else surfaces to the queue so attempt
/// counting reflects reality.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The resource lock could not be acquired; another saga holds it.
    #[error("other transaction in progress on {0}")]
    ResourceBusy(String),

    /// A step referenced by the job is not in the registry.
    #[error("Step function not found: {0}")]
    StepFunctionNotFound(String),

    /// A step's execute action failed.
    #[error("Step '{step}' failed: {reason}")]
    StepExecution { step: String, reason: String },

    /// An error raised by a step or compensation author.
    #[error("{0}")]
    Step(String),

    /// A saga must contain at least one step.
    #[error("saga has no steps")]
    NoSteps,

    /// The job does not exist.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The compensation failure record is missing or malformed.
    #[error("compensation failure record not found: {0}")]
    CompensationRecordNotFound(String),

    /// Key-value service error.
    #[error("key-value store error: {0}")]
    Kv(#[from] KvError),

    /// Job queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Convenience constructor for step-author errors.
    pub fn step(message: impl Into<String>) -> Self {
        SagaError::Step(message.into())
    }
}

/// Convenience type alias for orchestrator results.
pub type Result<T> = std::result::Result<T, SagaError>;
