//! Embedded in-memory store driver.
//!
//! Used when the broker is unreachable and throughout the test suite. All
//! state lives behind a single mutex in the current process, so locks taken
//! through this driver only serialize tasks within the process: the executor
//! degrades to single-node mode.
//!
//! Expiry is lazy: expired keys are purged when next touched.

use crate::error::StoreError;
use crate::store::{Store, StreamEntry};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    kv: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    streams: HashMap<String, Vec<StreamEntry>>,
    sets: HashMap<String, HashSet<String>>,
    expiry: HashMap<String, Instant>,
    stream_seq: u64,
}

impl Inner {
    fn purge(&mut self, key: &str) {
        if let Some(&deadline) = self.expiry.get(key)
            && Instant::now() >= deadline
        {
            self.expiry.remove(key);
            self.kv.remove(key);
            self.hashes.remove(key);
            self.streams.remove(key);
            self.sets.remove(key);
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.kv.contains_key(key)
            || self.hashes.contains_key(key)
            || self.streams.contains_key(key)
            || self.sets.contains_key(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiry.remove(key);
        let existed = self.kv.remove(key).is_some()
            | self.hashes.remove(key).is_some()
            | self.streams.remove(key).is_some()
            | self.sets.remove(key).is_some();
        existed
    }
}

/// Single-process, in-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panic mid-update; propagating the panic
        // is the only honest option for an in-process store.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner.kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.expiry.remove(key);
        inner.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.kv.insert(key.to_string(), value.to_string());
        inner.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner.remove(key))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.kv.insert(key.to_string(), value.to_string());
        if let Some(ttl) = ttl {
            inner.expiry.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        if inner.kv.get(key).is_some_and(|v| v == expected) {
            inner.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner
            .hashes
            .get_mut(key)
            .is_some_and(|hash| hash.remove(field).is_some()))
    }

    async fn stream_append(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        inner.stream_seq += 1;
        // Zero-padded so lexicographic order matches append order.
        let id = format!("{:016}-0", inner.stream_seq);
        inner
            .streams
            .entry(key.to_string())
            .or_default()
            .push(StreamEntry {
                id: id.clone(),
                fields: fields.to_vec(),
            });
        Ok(id)
    }

    async fn stream_range(
        &self,
        key: &str,
        from: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        let entries = inner.streams.get(key).cloned().unwrap_or_default();
        let filtered = entries
            .into_iter()
            .filter(|entry| from.is_none_or(|from| entry.id.as_str() >= from));
        Ok(match limit {
            Some(limit) => filtered.take(limit).collect(),
            None => filtered.collect(),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner.sets.get_mut(key).is_some_and(|set| set.remove(member)))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.purge(key);
        if !inner.exists(key) {
            return Ok(false);
        }
        inner.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
