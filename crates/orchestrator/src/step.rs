//! Steps: the execute/compensate pairs a saga is composed of.
//!
//! Persisted jobs reference steps by name only; behavior lives in the
//! process, looked up through the [`StepRegistry`](crate::StepRegistry).
//! Step results are opaque JSON values: each step's compensation is its
//! unique inverse and owns the interpretation of the result it receives.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use common::{JobId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SagaError};

/// The lifecycle status of a single step within a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet executed.
    #[default]
    Pending,

    /// Execution has begun; persisted before the step's side effects.
    InProgress,

    /// Execution finished; the result is recorded exactly once.
    Completed,

    /// Execution raised an error.
    Failed,
}

impl StepStatus {
    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted progress of one step inside a saga job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    /// Registry name of the step.
    pub name: String,

    /// Position in the saga, 0-based.
    pub index: usize,

    /// Current lifecycle status.
    pub status: StepStatus,

    /// Result of the execute action, written on transition to completed.
    pub result: Option<Value>,
}

impl StepState {
    /// Creates a pending step state.
    pub fn pending(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            status: StepStatus::Pending,
            result: None,
        }
    }
}

/// Execution context handed to a step's execute action.
///
/// Carries the results of previously completed steps by name, replacing
/// the closure capture a single-process workflow engine would use.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The saga job being executed.
    pub job_id: JobId,

    /// The principal the saga runs on behalf of.
    pub user_id: UserId,

    /// Results of completed steps, keyed by step name.
    pub results: HashMap<String, Value>,
}

impl StepContext {
    /// Returns the result of a previously completed step, if any.
    pub fn result_of(&self, step_name: &str) -> Option<&Value> {
        self.results.get(step_name)
    }
}

/// A step's executable pair: the forward action and its inverse.
///
/// Execute actions are required to be idempotent within a single saga:
/// after a crash between the in-progress checkpoint and the completion
/// checkpoint, the step runs exactly once more.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Runs the forward action and returns its result payload.
    async fn execute(&self, ctx: &StepContext) -> Result<Value>;

    /// Undoes the forward action, given the result it produced.
    async fn compensate(&self, result: &Value) -> Result<()>;

    /// Whether this step has a compensation at all.
    fn has_compensation(&self) -> bool {
        true
    }
}

/// Boxed future type for function-based steps.
pub type StepFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

type ExecuteFn = dyn Fn(StepContext) -> StepFuture<Value> + Send + Sync;
type CompensateFn = dyn Fn(Value) -> StepFuture<()> + Send + Sync;

/// A [`StepHandler`] built from closures.
///
/// Lets application and test code register steps without hand-written
/// handler structs:
///
/// ```ignore
/// registry.register(
///     "charge",
///     FnStep::new(|ctx| Box::pin(async move { Ok(json!({"charged": true})) }))
///         .with_compensation(|result| Box::pin(async move { Ok(()) })),
/// );
/// ```
pub struct FnStep {
    execute: Box<ExecuteFn>,
    compensate: Option<Box<CompensateFn>>,
}

impl FnStep {
    /// Creates a step from an execute closure, with no compensation.
    pub fn new<F>(execute: F) -> Self
    where
        F: Fn(StepContext) -> StepFuture<Value> + Send + Sync + 'static,
    {
        Self {
            execute: Box::new(execute),
            compensate: None,
        }
    }

    /// Attaches a compensation closure.
    pub fn with_compensation<F>(mut self, compensate: F) -> Self
    where
        F: Fn(Value) -> StepFuture<()> + Send + Sync + 'static,
    {
        self.compensate = Some(Box::new(compensate));
        self
    }
}

#[async_trait]
impl StepHandler for FnStep {
    async fn execute(&self, ctx: &StepContext) -> Result<Value> {
        (self.execute)(ctx.clone()).await
    }

    async fn compensate(&self, result: &Value) -> Result<()> {
        match &self.compensate {
            Some(f) => f(result.clone()).await,
            None => Err(SagaError::step("step has no compensation")),
        }
    }

    fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }
}
