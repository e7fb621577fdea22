//! Contract for the durable job queue the orchestrator enqueues sagas onto.
//!
//! The orchestrator assumes an existing durable FIFO work queue with
//! at-least-once delivery, per-job payload mutation, configurable attempt
//! budgets, and failure events. This crate defines that contract as the
//! [`JobQueue`] trait and ships [`InMemoryJobQueue`], an implementation with
//! the same interface used by tests and local runs.

pub mod error;
pub mod job;
pub mod memory;
pub mod queue;

pub use error::{QueueError, Result};
pub use job::{Job, JobState};
pub use memory::InMemoryJobQueue;
pub use queue::{EnqueueOptions, JobQueue, QueueEvent};
