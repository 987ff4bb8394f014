//! Store abstraction for the conflux workflow engine.
//!
//! The engine persists every state transition through a narrow [`Store`]
//! trait: key/value pairs with optional TTL, conditional set/delete for
//! locking, hashes, append-only streams, and sets.
//!
//! Two conforming drivers are provided:
//!
//! - [`RedisStore`]: the broker-backed driver, giving process-wide sharing
//!   and durability.
//! - [`MemoryStore`]: an embedded single-process driver used when the broker
//!   is unavailable. Locking still works within the process, which degrades
//!   the executor to single-node mode.
//!
//! [`DistributedLock`] builds a named, owner-tokened lock on top of the
//! conditional store operations.

pub mod error;
pub mod lock;
pub mod memory;
pub mod redis;
pub mod store;

pub use self::redis::RedisStore;
pub use error::{LockError, StoreError};
pub use lock::{DEFAULT_LOCK_TTL, DistributedLock, LockGuard};
pub use memory::MemoryStore;
pub use store::{Store, StreamEntry};
