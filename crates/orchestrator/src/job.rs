//! The saga job payload: resource identifiers and persisted step progress.

use chrono::{DateTime, Utc};
use common::UserId;
use serde::{Deserialize, Serialize};

use crate::step::{StepState, StepStatus};

/// A logical resource a saga touches, used to derive its lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    /// Resource kind, e.g. `"user"`, `"account"`.
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Resource instance identifier.
    pub id: String,

    /// Optional action discriminator, so distinct operations on the same
    /// resource can be locked independently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl ResourceIdentifier {
    /// Creates a resource identifier without an action discriminator.
    pub fn new(resource_type: impl Into<String>, id: impl ToString) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.to_string(),
            action: None,
        }
    }

    /// Creates a resource identifier with an action discriminator.
    pub fn with_action(
        resource_type: impl Into<String>,
        id: impl ToString,
        action: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.to_string(),
            action: Some(action.into()),
        }
    }

    /// The default resource set for a saga that declares none: the user.
    pub fn for_user(user_id: UserId) -> Self {
        Self::new("user", user_id.as_i64())
    }

    /// Returns the human-readable descriptor `<type>_<id>[_<action>]`.
    pub fn describe(&self) -> String {
        match &self.action {
            Some(action) => format!("{}_{}_{}", self.resource_type, self.id, action),
            None => format!("{}_{}", self.resource_type, self.id),
        }
    }

    /// Returns the lock key `tx_lock:<type>_<id>[_<action>]`.
    pub fn lock_key(&self) -> String {
        format!("tx_lock:{}", self.describe())
    }
}

/// The persisted saga instance, carried as the queue job payload.
///
/// Mutated only by the worker owning the lock. `current_step_index` is the
/// next step to execute; it is monotonically non-decreasing across worker
/// observations of the same job, which is what makes resume-after-crash a
/// plain re-read of the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaJob {
    /// The principal the saga runs on behalf of.
    pub user_id: UserId,

    /// Ordered step states.
    pub steps: Vec<StepState>,

    /// Index of the next step to execute.
    pub current_step_index: usize,

    /// When the saga was created.
    pub created_at: DateTime<Utc>,

    /// Client-supplied idempotency token, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// The resources this saga touches.
    pub resource_identifiers: Vec<ResourceIdentifier>,
}

impl SagaJob {
    /// Creates a new saga job with all steps pending.
    pub fn new(
        user_id: UserId,
        step_names: Vec<String>,
        resource_identifiers: Vec<ResourceIdentifier>,
        idempotency_key: Option<String>,
    ) -> Self {
        let steps = step_names
            .into_iter()
            .enumerate()
            .map(|(index, name)| StepState::pending(name, index))
            .collect();
        Self {
            user_id,
            steps,
            current_step_index: 0,
            created_at: Utc::now(),
            idempotency_key,
            resource_identifiers,
        }
    }

    /// Returns the declared resources, falling back to the owning user when
    /// the saga declared none.
    pub fn resources_or_default(&self) -> Vec<ResourceIdentifier> {
        if self.resource_identifiers.is_empty() {
            vec![ResourceIdentifier::for_user(self.user_id)]
        } else {
            self.resource_identifiers.clone()
        }
    }

    /// Names of steps that have completed, in execution order.
    pub fn completed_step_names(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Name of the step currently marked failed, if any.
    pub fn failed_step_name(&self) -> Option<String> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| s.name.clone())
    }
}
