//! The `Store` trait: the engine's only persistence surface.
//!
//! Values are opaque strings; callers serialize. Keys are flat, colon-namespaced
//! strings owned by the engine's cache layer.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// One entry of an append-only stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// The driver-assigned, monotonically increasing entry id.
    pub id: String,
    /// Field/value pairs in append order.
    pub fields: Vec<(String, String)>,
}

/// Durable key/value + ordered stream store.
///
/// All operations are atomic with respect to each other; `set_if_absent` and
/// `delete_if` are the conditional primitives the distributed lock is built
/// on. Drivers must be safe to share across tasks.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Reads a plain value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a plain value with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Writes a plain value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Deletes a key of any kind. Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Writes `value` only if `key` does not exist, with an optional expiry.
    ///
    /// Returns `true` if the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Deletes `key` only if its current value equals `expected`.
    ///
    /// Returns `true` if the key was deleted. This is the safe-release
    /// primitive for locks: a lock that expired and was reacquired by a new
    /// owner no longer matches and is left alone.
    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Sets a field in a hash, creating the hash if needed.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Reads a single hash field.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Reads all fields of a hash. Missing hashes read as empty.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Deletes a hash field. Returns `true` if the field existed.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Appends an entry to a stream and returns its assigned id.
    async fn stream_append(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<String, StoreError>;

    /// Reads stream entries in append order.
    ///
    /// `from` is an inclusive lower bound on entry ids (`None` reads from the
    /// beginning); `limit` caps the number of entries returned.
    async fn stream_range(
        &self,
        key: &str,
        from: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Adds a member to a set. Returns `true` if it was not already present.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Removes a member from a set. Returns `true` if it was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Reads all members of a set. Order is unspecified.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Sets or refreshes the expiry on an existing key.
    ///
    /// Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Checks connectivity to the backing store.
    async fn ping(&self) -> Result<(), StoreError>;
}
