//! Resource lock manager: at-most-one active saga per resource set.

use std::time::Duration;

use common::JobId;
use kv_store::KvStore;

use crate::error::Result;
use crate::job::ResourceIdentifier;

/// Acquires and releases named resource locks with a TTL.
///
/// Lock keys follow `tx_lock:<type>_<id>[_<action>]`; the value is the
/// owning job ID. Release is owner-verified through the store's atomic
/// multi-key delete-if-value, so a worker can never destroy another
/// worker's lock. The TTL bounds orphaned-lock lifetime after a crash.
pub struct LockManager<K: KvStore> {
    kv: K,
    default_ttl: Duration,
}

impl<K: KvStore> LockManager<K> {
    /// Creates a lock manager with the given default TTL.
    pub fn new(kv: K, default_ttl: Duration) -> Self {
        Self { kv, default_ttl }
    }

    /// The configured default TTL.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Attempts to acquire every lock in `resources` for `job_id`.
    ///
    /// Keys are taken one at a time in input order; acquisition across the
    /// set is not atomic. On the first conflict every key acquired in this
    /// call is released (owner-verified) and the call returns false. Two
    /// callers racing for overlapping sets may therefore both fail; the
    /// queue retry layer guarantees progress, this layer guarantees no
    /// double-commit.
    pub async fn acquire(
        &self,
        resources: &[ResourceIdentifier],
        job_id: JobId,
        ttl: Duration,
    ) -> Result<bool> {
        let owner = job_id.to_string();
        let mut acquired: Vec<String> = Vec::with_capacity(resources.len());

        for resource in resources {
            let key = resource.lock_key();
            match self.kv.set_nx_ex(&key, &owner, ttl).await {
                Ok(true) => acquired.push(key),
                Ok(false) => {
                    tracing::debug!(%job_id, %key, "lock conflict, rolling back partial acquisition");
                    self.rollback(&acquired, &owner).await;
                    return Ok(false);
                }
                Err(e) => {
                    self.rollback(&acquired, &owner).await;
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(%job_id, locks = acquired.len(), "resource locks acquired");
        Ok(true)
    }

    /// Acquires with the manager's default TTL.
    pub async fn acquire_default(
        &self,
        resources: &[ResourceIdentifier],
        job_id: JobId,
    ) -> Result<bool> {
        self.acquire(resources, job_id, self.default_ttl).await
    }

    /// Releases the locks for `resources` held by `job_id`.
    ///
    /// Runs the owner-verified delete: keys whose value is not `job_id` are
    /// left alone and logged, never failed on. Returns how many keys were
    /// actually deleted.
    pub async fn release(&self, resources: &[ResourceIdentifier], job_id: JobId) -> Result<usize> {
        let keys: Vec<String> = resources.iter().map(|r| r.lock_key()).collect();
        let deleted = self.kv.delete_if_value(&keys, &job_id.to_string()).await?;

        if deleted < keys.len() {
            tracing::warn!(
                %job_id,
                expected = keys.len(),
                deleted,
                "some locks were not owned at release (expired or held by another job)"
            );
        }
        Ok(deleted)
    }

    async fn rollback(&self, acquired: &[String], owner: &str) {
        if acquired.is_empty() {
            return;
        }
        if let Err(e) = self.kv.delete_if_value(acquired, owner).await {
            tracing::warn!(error = %e, "failed to roll back partially acquired locks; TTL will reap them");
        }
    }
}
