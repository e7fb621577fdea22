use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Core trait for key-value service implementations.
///
/// Models the command set the orchestrator needs from its data-structure
/// server: plain strings with expiry, hashes, sets, and one scripted
/// multi-key operation ([`delete_if_value`](KvStore::delete_if_value)).
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Sets `key` to `value` only if the key is absent, with a TTL.
    ///
    /// Returns true if the key was set, false if it already existed.
    /// This is the atomic primitive lock acquisition is built on.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Sets `key` to `value` unconditionally, with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns the string value of `key`, or None if absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Deletes `key`. Returns true if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically deletes each key whose current value equals `value`.
    ///
    /// Returns the number of keys deleted. The whole multi-key operation is
    /// a single atomic unit; a server-backed implementation runs it as a
    /// server-side script so that no interleaved write can observe a
    /// partially released set. This is the owner-verified delete used for
    /// lock release.
    async fn delete_if_value(&self, keys: &[String], value: &str) -> Result<usize>;

    /// Sets a single field on the hash at `key`, creating the hash if absent.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Replaces or merges all given fields on the hash at `key`.
    async fn hash_set_all(&self, key: &str, fields: HashMap<String, String>) -> Result<()>;

    /// Returns all fields of the hash at `key`, or None if absent.
    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    /// Adds `member` to the set at `key`. Returns true if it was not present.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    /// Removes `member` from the set at `key`. Returns true if it was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns all members of the set at `key` (empty if absent).
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Applies a TTL to an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Returns the remaining TTL of `key`, or None if the key is absent or
    /// has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Returns true if `key` exists.
    async fn exists(&self, key: &str) -> Result<bool>;
}
