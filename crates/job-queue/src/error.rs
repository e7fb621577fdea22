use common::JobId;
use thiserror::Error;

use crate::JobState;

/// Errors that can occur when interacting with the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job does not exist in the queue.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The job is not in the state the operation requires.
    #[error("job {job_id} is {actual}, expected {expected}")]
    InvalidState {
        job_id: JobId,
        expected: JobState,
        actual: JobState,
    },

    /// The backing queue failed or was unreachable.
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
