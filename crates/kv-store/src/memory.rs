use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{KvError, KvStore, Result};

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// In-memory key-value store implementation for testing and local runs.
///
/// Provides the same interface as a server-backed implementation. Every
/// command runs under a single mutex, which makes the multi-key
/// `delete_if_value` trivially atomic. Expired keys are treated as absent
/// on read and purged on write.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryKvStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every key. Intended for test isolation.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Returns the number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Returns true if the store holds no live keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, e| e.is_live(now));
}

fn live_entry<'a>(
    entries: &'a HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a Entry> {
    entries.get(key).filter(|e| e.is_live(now))
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, now);

        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::String(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::String(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        match live_entry(&entries, key, now) {
            Some(Entry {
                value: Value::String(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, now);
        Ok(entries.remove(key).is_some())
    }

    async fn delete_if_value(&self, keys: &[String], value: &str) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, now);

        let mut deleted = 0;
        for key in keys {
            let matches = matches!(
                entries.get(key),
                Some(Entry {
                    value: Value::String(s),
                    ..
                }) if s == value
            );
            if matches {
                entries.remove(key);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, now);

        match entries.get_mut(key) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => {
                let mut h = HashMap::new();
                h.insert(field.to_string(), value.to_string());
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(h),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn hash_set_all(&self, key: &str, fields: HashMap<String, String>) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, now);

        match entries.get_mut(key) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => {
                h.extend(fields);
                Ok(())
            }
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(fields),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        match live_entry(&entries, key, now) {
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h.clone())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, now);

        match entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.insert(member.to_string())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => {
                let mut s = BTreeSet::new();
                s.insert(member.to_string());
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(s),
                        expires_at: None,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, now);

        match entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.remove(member)),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        match live_entry(&entries, key, now) {
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(s.iter().cloned().collect()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, now);

        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(live_entry(&entries, key, now)
            .and_then(|e| e.expires_at)
            .map(|deadline| deadline - now))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(live_entry(&entries, key, now).is_some())
    }
}
