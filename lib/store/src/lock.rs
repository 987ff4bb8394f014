//! Named distributed lock over the store's conditional primitives.
//!
//! Acquisition is set-if-absent with a fresh owner token; release is
//! compare-and-delete against that token. Expiration is passive: a crashed
//! holder simply stops refreshing and the key times out, after which any
//! other process may acquire. A late release by the dead holder is a no-op
//! because its token no longer matches.

use crate::error::{LockError, StoreError};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Factory for named locks backed by a shared store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn Store>,
}

impl DistributedLock {
    /// Creates a lock factory over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Attempts to acquire the named lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if another owner currently holds
    /// the lock, or [`LockError::Store`] if the store fails.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let owner = Ulid::new().to_string();
        let acquired = self
            .store
            .set_if_absent(name, &owner, Some(ttl))
            .await?;

        if !acquired {
            return Err(LockError::Unavailable {
                name: name.to_string(),
            });
        }

        Ok(LockGuard {
            store: Arc::clone(&self.store),
            name: name.to_string(),
            owner,
        })
    }
}

/// A held lock. Release explicitly with [`LockGuard::release`]; an unreleased
/// guard expires on its own after the TTL.
pub struct LockGuard {
    store: Arc<dyn Store>,
    name: String,
    owner: String,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish()
    }
}

impl LockGuard {
    /// Returns the lock name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owner token of this acquisition.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Releases the lock.
    ///
    /// Returns `false` if the lock was no longer held by this owner (it
    /// expired and may have been reacquired elsewhere); that case is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails.
    pub async fn release(self) -> Result<bool, StoreError> {
        self.store.delete_if(&self.name, &self.owner).await
    }
}
