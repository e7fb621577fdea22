//! Compensation engine: reverse rollback of completed steps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::JobId;
use kv_store::KvStore;
use serde_json::Value;

use crate::classify::ClassificationTable;
use crate::error::{Result, SagaError};
use crate::registry::StepRegistry;
use crate::step::StepHandler;

const INDEX_KEY: &str = "compensation_failures:index";

/// One completed step of the current run: what to undo and with what input.
pub struct TrailEntry {
    /// Registry name of the step.
    pub name: String,

    /// The result its execute action returned.
    pub result: Value,

    /// The handler whose compensate action undoes it.
    pub handler: Arc<dyn StepHandler>,
}

/// Outcome of a compensation pass.
#[derive(Debug, Default)]
pub struct CompensationReport {
    /// Steps whose compensation succeeded, in rollback order.
    pub compensated: Vec<String>,

    /// Steps whose compensation failed and was recorded.
    pub failed: Vec<String>,
}

/// A persisted compensation failure awaiting operator retry.
#[derive(Debug, Clone)]
pub struct CompensationFailureRecord {
    /// The kv key the record lives under.
    pub key: String,
    pub job_id: JobId,
    pub step_name: String,
    /// Snapshot of the step result the compensation was invoked with.
    pub step_result: Value,
    pub error_message: String,
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

impl CompensationFailureRecord {
    fn storage_key(job_id: JobId, step_name: &str) -> String {
        format!("compensation_failure:{job_id}:{step_name}")
    }

    fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("job_id".to_string(), self.job_id.to_string());
        fields.insert("step_name".to_string(), self.step_name.clone());
        fields.insert("step_result".to_string(), self.step_result.to_string());
        fields.insert("error_message".to_string(), self.error_message.clone());
        fields.insert("retryable".to_string(), self.retryable.to_string());
        fields.insert("failed_at".to_string(), self.failed_at.to_rfc3339());
        fields
    }

    fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let missing = || SagaError::CompensationRecordNotFound(key.to_string());

        let job_id = fields
            .get("job_id")
            .and_then(|v| v.parse().ok())
            .ok_or_else(missing)?;
        let step_name = fields.get("step_name").ok_or_else(missing)?.clone();
        let step_result = fields
            .get("step_result")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or(Value::Null);
        let error_message = fields.get("error_message").cloned().unwrap_or_default();
        let retryable = fields
            .get("retryable")
            .is_some_and(|v| v.parse().unwrap_or(false));
        let failed_at = fields
            .get("failed_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(missing)?;

        Ok(Self {
            key: key.to_string(),
            job_id,
            step_name,
            step_result,
            error_message,
            retryable,
            failed_at,
        })
    }
}

/// Rolls back completed steps in reverse execution order.
///
/// Every compensation runs best-effort: a failure is recorded with a
/// retryability classification and does not stop compensation of the
/// remaining earlier steps, nor does it change the saga's final outcome.
pub struct CompensationEngine<K: KvStore> {
    kv: K,
    table: ClassificationTable,
    retention: Duration,
}

impl<K: KvStore> CompensationEngine<K> {
    /// Creates an engine with the default compensation classification table.
    pub fn new(kv: K, retention: Duration) -> Self {
        Self {
            kv,
            table: ClassificationTable::compensation_defaults(),
            retention,
        }
    }

    /// Compensates the success trail of `job_id`, last completed step first.
    ///
    /// `trail` is in execution order; the engine walks it in reverse. Steps
    /// without a compensation are skipped.
    pub async fn run(&self, job_id: JobId, trail: &[TrailEntry]) -> CompensationReport {
        let mut report = CompensationReport::default();

        for entry in trail.iter().rev() {
            if !entry.handler.has_compensation() {
                tracing::debug!(%job_id, step = %entry.name, "step has no compensation, skipping");
                continue;
            }

            match entry.handler.compensate(&entry.result).await {
                Ok(()) => {
                    tracing::info!(%job_id, step = %entry.name, "step compensated");
                    report.compensated.push(entry.name.clone());
                }
                Err(e) => {
                    metrics::counter!("compensation_failures_total").increment(1);
                    let retryable = self.table.is_retryable(&e.to_string());
                    tracing::error!(
                        %job_id,
                        step = %entry.name,
                        error = %e,
                        retryable,
                        "compensation failed"
                    );
                    if let Err(persist_err) = self
                        .record_failure(job_id, entry, &e.to_string(), retryable)
                        .await
                    {
                        tracing::error!(
                            %job_id,
                            step = %entry.name,
                            error = %persist_err,
                            "failed to persist compensation failure record"
                        );
                    }
                    report.failed.push(entry.name.clone());
                }
            }
        }

        report
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        entry: &TrailEntry,
        error_message: &str,
        retryable: bool,
    ) -> Result<()> {
        let record = CompensationFailureRecord {
            key: CompensationFailureRecord::storage_key(job_id, &entry.name),
            job_id,
            step_name: entry.name.clone(),
            step_result: entry.result.clone(),
            error_message: error_message.to_string(),
            retryable,
            failed_at: Utc::now(),
        };

        self.kv
            .hash_set_all(&record.key, record.to_fields())
            .await?;
        self.kv.expire(&record.key, self.retention).await?;
        self.kv.set_add(INDEX_KEY, &record.key).await?;
        Ok(())
    }

    /// Returns all live compensation failure records.
    ///
    /// Index entries whose record has expired are pruned as they are seen.
    pub async fn list_failures(&self) -> Result<Vec<CompensationFailureRecord>> {
        let keys = self.kv.set_members(INDEX_KEY).await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            match self.kv.hash_get_all(&key).await? {
                Some(fields) => records.push(CompensationFailureRecord::from_fields(&key, &fields)?),
                None => {
                    self.kv.set_remove(INDEX_KEY, &key).await?;
                }
            }
        }

        records.sort_by_key(|r| r.failed_at);
        Ok(records)
    }

    /// Operator retry of a recorded compensation failure.
    ///
    /// Looks the step up by name, re-invokes its compensate with the
    /// persisted result, and removes the record on success.
    pub async fn retry_failure(&self, key: &str, registry: &StepRegistry) -> Result<()> {
        let fields = self
            .kv
            .hash_get_all(key)
            .await?
            .ok_or_else(|| SagaError::CompensationRecordNotFound(key.to_string()))?;
        let record = CompensationFailureRecord::from_fields(key, &fields)?;

        let handler = registry
            .get(&record.step_name)
            .ok_or_else(|| SagaError::StepFunctionNotFound(record.step_name.clone()))?;

        handler.compensate(&record.step_result).await?;

        self.kv.delete(key).await?;
        self.kv.set_remove(INDEX_KEY, key).await?;
        tracing::info!(job_id = %record.job_id, step = %record.step_name, "compensation retry succeeded");
        Ok(())
    }
}
