use chrono::{DateTime, Utc};
use common::JobId;
use serde_json::Value;

/// Queue-level lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Enqueued and waiting for a worker.
    Waiting,

    /// Leased by a worker; invisible to other workers until settled.
    Active,

    /// Finished successfully (terminal state).
    Completed,

    /// Exhausted its attempt budget (terminal state).
    Failed,
}

impl JobState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A job as observed through the queue: payload plus delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct Job {
    /// Queue-assigned identifier.
    pub id: JobId,

    /// The job payload. Mutable in place via
    /// [`JobQueue::update_payload`](crate::JobQueue::update_payload).
    pub payload: Value,

    /// Current lifecycle state.
    pub state: JobState,

    /// Number of deliveries so far, including the current one.
    pub attempts_made: u32,

    /// Attempt budget. When `attempts_made` reaches this on failure the job
    /// is terminally failed instead of re-queued.
    pub max_attempts: u32,

    /// Observational progress, 0..=100.
    pub progress: u8,

    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the current (or last) delivery began.
    pub processed_on: Option<DateTime<Utc>>,

    /// When the job reached a terminal state.
    pub finished_on: Option<DateTime<Utc>>,

    /// Failure message from the last failed delivery.
    pub failed_reason: Option<String>,

    /// Result recorded on completion.
    pub result: Option<Value>,
}
