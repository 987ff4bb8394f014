//! Error types for store and lock operations.

use std::fmt;

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Failed to connect to the backing store.
    Connection { message: String },
    /// A command against the store failed.
    Command { message: String },
    /// The store returned data that could not be decoded.
    Decode { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { message } => write!(f, "store connection failed: {message}"),
            Self::Command { message } => write!(f, "store command failed: {message}"),
            Self::Decode { message } => write!(f, "store reply decode failed: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from distributed lock operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock is currently held by another owner.
    Unavailable { name: String },
    /// The underlying store failed.
    Store(StoreError),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { name } => write!(f, "lock unavailable: {name}"),
            Self::Store(e) => write!(f, "lock store error: {e}"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<StoreError> for LockError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
