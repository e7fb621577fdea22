//! Dead-letter quarantine for sagas that exhausted automatic handling.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{JobId, UserId};
use kv_store::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::classify::{FailureKind, Priority};
use crate::error::{Result, SagaError};
use crate::job::SagaJob;

const ACTIVE_SET: &str = "dlq:job_ids";
const HIGH_PRIORITY_SET: &str = "dlq:high_priority";
const PROCESSED_SET: &str = "dlq:processed";

/// Guard keys dedupe quarantine writes per (job, attempt); they only need
/// to outlive any plausible duplicate failure handling.
const GUARD_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Unique identifier for a quarantine record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuarantineId(Uuid);

impl QuarantineId {
    /// Creates a new random quarantine ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for QuarantineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QuarantineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for QuarantineId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A quarantined saga: everything an operator needs for manual remediation.
#[derive(Debug, Clone)]
pub struct QuarantineRecord {
    pub id: QuarantineId,
    pub original_job_id: JobId,
    /// Snapshot of the saga payload at the time of failure.
    pub original_job_data: Value,
    pub failure_reason: String,
    pub failure_stack: String,
    pub failed_at: DateTime<Utc>,
    /// Names of steps that had completed before the failure.
    pub completed_steps: Vec<String>,
    /// The step that failed, when one had been reached.
    pub failed_step: Option<String>,
    pub user_id: UserId,
    pub priority: Priority,
    pub can_retry: bool,
    /// Opaque business metadata for operator triage.
    pub business_context: Value,
    pub processed_at: Option<DateTime<Utc>>,
    pub processor_note: Option<String>,
}

impl QuarantineRecord {
    /// Builds a record from a failed saga run and its classification.
    pub fn from_failure(
        job_id: JobId,
        saga: &SagaJob,
        error: &SagaError,
        kind: FailureKind,
    ) -> Self {
        Self {
            id: QuarantineId::new(),
            original_job_id: job_id,
            original_job_data: serde_json::to_value(saga).unwrap_or(Value::Null),
            failure_reason: error.to_string(),
            failure_stack: format!("{error:?}"),
            failed_at: Utc::now(),
            completed_steps: saga.completed_step_names(),
            failed_step: saga.failed_step_name(),
            user_id: saga.user_id,
            priority: kind.priority(),
            can_retry: kind.can_retry(),
            business_context: serde_json::json!({
                "resource_identifiers": saga.resource_identifiers,
                "idempotency_key": saga.idempotency_key,
            }),
            processed_at: None,
            processor_note: None,
        }
    }

    fn storage_key(id: QuarantineId) -> String {
        format!("dlq:{id}")
    }

    fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), self.id.to_string());
        fields.insert(
            "original_job_id".to_string(),
            self.original_job_id.to_string(),
        );
        fields.insert(
            "original_job_data".to_string(),
            self.original_job_data.to_string(),
        );
        fields.insert("failure_reason".to_string(), self.failure_reason.clone());
        fields.insert("failure_stack".to_string(), self.failure_stack.clone());
        fields.insert("failed_at".to_string(), self.failed_at.to_rfc3339());
        fields.insert(
            "completed_steps".to_string(),
            serde_json::to_string(&self.completed_steps).unwrap_or_else(|_| "[]".to_string()),
        );
        if let Some(step) = &self.failed_step {
            fields.insert("failed_step".to_string(), step.clone());
        }
        fields.insert("user_id".to_string(), self.user_id.to_string());
        fields.insert("priority".to_string(), self.priority.to_string());
        fields.insert("can_retry".to_string(), self.can_retry.to_string());
        fields.insert(
            "business_context".to_string(),
            self.business_context.to_string(),
        );
        if let Some(at) = self.processed_at {
            fields.insert("processed_at".to_string(), at.to_rfc3339());
        }
        if let Some(note) = &self.processor_note {
            fields.insert("processor_note".to_string(), note.clone());
        }
        fields
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let missing = |field: &str| {
            SagaError::Step(format!("quarantine record missing field '{field}'"))
        };

        Ok(Self {
            id: fields
                .get("id")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| missing("id"))?,
            original_job_id: fields
                .get("original_job_id")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| missing("original_job_id"))?,
            original_job_data: fields
                .get("original_job_data")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or(Value::Null),
            failure_reason: fields.get("failure_reason").cloned().unwrap_or_default(),
            failure_stack: fields.get("failure_stack").cloned().unwrap_or_default(),
            failed_at: fields
                .get("failed_at")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| missing("failed_at"))?,
            completed_steps: fields
                .get("completed_steps")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            failed_step: fields.get("failed_step").cloned(),
            user_id: fields
                .get("user_id")
                .and_then(|v| v.parse().ok())
                .map(UserId::new)
                .ok_or_else(|| missing("user_id"))?,
            priority: fields
                .get("priority")
                .and_then(|v| v.parse().ok())
                .unwrap_or(Priority::Normal),
            can_retry: fields
                .get("can_retry")
                .is_some_and(|v| v.parse().unwrap_or(false)),
            business_context: fields
                .get("business_context")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or(Value::Null),
            processed_at: fields
                .get("processed_at")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
            processor_note: fields.get("processor_note").cloned(),
        })
    }
}

/// Aggregate counts over the quarantine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineStats {
    pub total_active: usize,
    pub high_priority: usize,
    pub total_processed: usize,
    pub oldest_failure: Option<DateTime<Utc>>,
}

/// Persists terminal saga failures for operator inspection.
///
/// A quarantined job is never re-enqueued automatically; requeueing a
/// retryable record is an operator-driven action.
pub struct QuarantineStore<K: KvStore> {
    kv: K,
}

impl<K: KvStore> QuarantineStore<K> {
    /// Creates a quarantine store on the given kv service.
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// Persists a record and indexes it. Returns the quarantine ID.
    pub async fn add(&self, record: QuarantineRecord) -> Result<QuarantineId> {
        let id = record.id;
        self.kv
            .hash_set_all(&QuarantineRecord::storage_key(id), record.to_fields())
            .await?;
        self.kv.set_add(ACTIVE_SET, &id.to_string()).await?;
        if record.priority == Priority::High {
            self.kv.set_add(HIGH_PRIORITY_SET, &id.to_string()).await?;
        }
        metrics::counter!("saga_quarantined_total").increment(1);
        tracing::warn!(
            quarantine_id = %id,
            job_id = %record.original_job_id,
            priority = %record.priority,
            can_retry = record.can_retry,
            reason = %record.failure_reason,
            "saga quarantined"
        );
        Ok(id)
    }

    /// Persists a record at most once per (job, attempt).
    ///
    /// Repeated failure handling for the same delivery is a no-op, so
    /// duplicate quarantine entries cannot be produced for one attempt.
    pub async fn add_once(
        &self,
        job_id: JobId,
        attempt: u32,
        record: QuarantineRecord,
    ) -> Result<Option<QuarantineId>> {
        let guard_key = format!("dlq:guard:{job_id}:{attempt}");
        if !self
            .kv
            .set_nx_ex(&guard_key, &record.id.to_string(), GUARD_TTL)
            .await?
        {
            tracing::debug!(%job_id, attempt, "quarantine entry already recorded for this attempt");
            return Ok(None);
        }
        Ok(Some(self.add(record).await?))
    }

    /// Fetches a record by ID.
    pub async fn get(&self, id: QuarantineId) -> Result<Option<QuarantineRecord>> {
        match self
            .kv
            .hash_get_all(&QuarantineRecord::storage_key(id))
            .await?
        {
            Some(fields) => Ok(Some(QuarantineRecord::from_fields(&fields)?)),
            None => Ok(None),
        }
    }

    /// All active records, oldest failure first.
    pub async fn get_all_active(&self) -> Result<Vec<QuarantineRecord>> {
        self.load_sorted(ACTIVE_SET).await
    }

    /// Active high-priority records, oldest failure first.
    pub async fn get_high_priority(&self) -> Result<Vec<QuarantineRecord>> {
        self.load_sorted(HIGH_PRIORITY_SET).await
    }

    /// Active records an operator may requeue (`can_retry` set).
    pub async fn get_retryable(&self) -> Result<Vec<QuarantineRecord>> {
        let records = self.get_all_active().await?;
        Ok(records.into_iter().filter(|r| r.can_retry).collect())
    }

    /// Moves a record from the active indices to the processed index,
    /// stamping when and by what note it was handled.
    ///
    /// Returns false if the ID is not active.
    pub async fn mark_handled(&self, id: QuarantineId, note: &str) -> Result<bool> {
        let member = id.to_string();
        if !self.kv.set_remove(ACTIVE_SET, &member).await? {
            return Ok(false);
        }
        self.kv.set_remove(HIGH_PRIORITY_SET, &member).await?;
        self.kv.set_add(PROCESSED_SET, &member).await?;

        let key = QuarantineRecord::storage_key(id);
        self.kv
            .hash_set(&key, "processed_at", &Utc::now().to_rfc3339())
            .await?;
        self.kv.hash_set(&key, "processor_note", note).await?;
        tracing::info!(quarantine_id = %id, note, "quarantine record handled");
        Ok(true)
    }

    /// Aggregate statistics over the quarantine.
    pub async fn stats(&self) -> Result<QuarantineStats> {
        let active = self.get_all_active().await?;
        let high_priority = self.kv.set_members(HIGH_PRIORITY_SET).await?.len();
        let total_processed = self.kv.set_members(PROCESSED_SET).await?.len();
        let oldest_failure = active.first().map(|r| r.failed_at);

        Ok(QuarantineStats {
            total_active: active.len(),
            high_priority,
            total_processed,
            oldest_failure,
        })
    }

    async fn load_sorted(&self, index: &str) -> Result<Vec<QuarantineRecord>> {
        let ids = self.kv.set_members(index).await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = id.parse::<QuarantineId>() else {
                continue;
            };
            if let Some(record) = self.get(id).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.failed_at);
        Ok(records)
    }
}
