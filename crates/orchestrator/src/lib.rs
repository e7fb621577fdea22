//! Saga-style logical transaction orchestrator.
//!
//! Provides all-or-nothing semantics over a persistence layer without
//! multi-statement transactions: business workflows run as ordered sequences
//! of steps, each with an execute and a compensate action. On failure,
//! completed steps are compensated in reverse order.
//!
//! The moving parts:
//! - a [`StepRegistry`] mapping step names to their execute/compensate pairs,
//! - a [`LockManager`] serializing concurrent work on the same resources,
//! - a [`SagaCoordinator`] that enqueues saga jobs with idempotency,
//! - a [`SagaWorker`] that drives the state machine and checkpoints progress
//!   so a crashed worker resumes from the last uncompleted step,
//! - a [`CompensationEngine`] rolling back completed steps on failure,
//! - a [`QuarantineStore`] holding irrecoverable work for operators.

pub mod classify;
pub mod compensation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod lock;
pub mod quarantine;
pub mod registry;
pub mod step;
pub mod worker;

pub use classify::{ClassificationTable, FailureKind, Priority};
pub use compensation::{
    CompensationEngine, CompensationFailureRecord, CompensationReport, TrailEntry,
};
pub use config::OrchestratorConfig;
pub use coordinator::{JobStatus, SagaCoordinator};
pub use error::{Result, SagaError};
pub use job::{ResourceIdentifier, SagaJob};
pub use lock::LockManager;
pub use quarantine::{QuarantineId, QuarantineRecord, QuarantineStats, QuarantineStore};
pub use registry::StepRegistry;
pub use step::{FnStep, StepContext, StepFuture, StepHandler, StepState, StepStatus};
pub use worker::{SagaRunSummary, SagaWorker};
