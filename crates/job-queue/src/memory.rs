use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::JobId;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};

use crate::{EnqueueOptions, Job, JobQueue, JobState, QueueError, QueueEvent, Result};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
}

/// In-memory job queue implementation for testing and local runs.
///
/// Provides the same interface as a durable backend. Visibility locking is
/// modeled by the waiting/active split: a job leased by `take_next` is out
/// of the waiting list until `fail` re-queues it.
#[derive(Clone)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    events: broadcast::Sender<QueueEvent>,
}

impl InMemoryJobQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            events,
        }
    }

    /// Returns the total number of jobs ever enqueued and still tracked.
    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    /// Returns the number of jobs currently waiting for a worker.
    pub async fn waiting_count(&self) -> usize {
        self.state.lock().await.waiting.len()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine; events are best-effort observability.
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, payload: Value, options: EnqueueOptions) -> Result<JobId> {
        let job_id = JobId::new();
        let job = Job {
            id: job_id,
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            progress: 0,
            created_at: Utc::now(),
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            result: None,
        };

        let mut state = self.state.lock().await;
        state.jobs.insert(job_id, job);
        state.waiting.push_back(job_id);
        Ok(job_id)
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn update_payload(&self, job_id: JobId, payload: Value) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        job.payload = payload;
        Ok(())
    }

    async fn update_progress(&self, job_id: JobId, progress: u8) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::JobNotFound(job_id))?;
            job.progress = progress.min(100);
        }
        self.emit(QueueEvent::Progress {
            job_id,
            progress: progress.min(100),
        });
        Ok(())
    }

    async fn take_next(&self) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let Some(job_id) = state.waiting.pop_front() else {
            return Ok(None);
        };
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_on = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: JobId, result: Value) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::JobNotFound(job_id))?;
            if job.state != JobState::Active {
                return Err(QueueError::InvalidState {
                    job_id,
                    expected: JobState::Active,
                    actual: job.state,
                });
            }
            job.state = JobState::Completed;
            job.finished_on = Some(Utc::now());
            job.progress = 100;
            job.result = Some(result.clone());
        }
        self.emit(QueueEvent::Completed { job_id, result });
        Ok(())
    }

    async fn fail(&self, job_id: JobId, reason: &str) -> Result<()> {
        let terminal = {
            let mut state = self.state.lock().await;
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::JobNotFound(job_id))?;
            if job.state != JobState::Active {
                return Err(QueueError::InvalidState {
                    job_id,
                    expected: JobState::Active,
                    actual: job.state,
                });
            }
            job.failed_reason = Some(reason.to_string());
            if job.attempts_made < job.max_attempts {
                job.state = JobState::Waiting;
                state.waiting.push_back(job_id);
                false
            } else {
                job.state = JobState::Failed;
                job.finished_on = Some(Utc::now());
                true
            }
        };

        if terminal {
            self.emit(QueueEvent::Failed {
                job_id,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}
