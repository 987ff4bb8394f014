//! Versioned encoding for persisted values.
//!
//! Every value the engine writes through the store (execution state, node
//! records, outputs, result-cache entries, events) carries a leading version
//! integer. Keys stay stable across releases; the version lets readers
//! reject or migrate payloads written by a newer schema during rolling
//! deployments.
//!
//! [`Envelope::encode`] and [`Envelope::decode`] are the only paths between
//! engine types and store strings; the cache never serializes directly.

use crate::error::EngineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The current payload schema version.
pub const CURRENT_VERSION: u32 = 1;

/// A stored value: a leading schema version, then the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the payload schema.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

/// Borrowing mirror of [`Envelope`] so encoding never clones the payload.
#[derive(Serialize)]
struct BorrowedEnvelope<'a, T> {
    version: u32,
    payload: &'a T,
}

/// Version probe; deserializes only the leading integer.
#[derive(Deserialize)]
struct Version {
    version: u32,
}

impl<T: Serialize> Envelope<T> {
    /// Serializes a payload under the current schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn encode(payload: &T) -> Result<String, EngineError> {
        Ok(serde_json::to_string(&BorrowedEnvelope {
            version: CURRENT_VERSION,
            payload,
        })?)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decodes a stored value, checking the version before touching the
    /// payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the value was written by a newer schema, or if
    /// deserialization fails.
    pub fn decode(raw: &str) -> Result<T, EngineError> {
        let probe: Version = serde_json::from_str(raw)?;
        if probe.version > CURRENT_VERSION {
            return Err(EngineError::Serialization {
                message: format!("unsupported envelope version {}", probe.version),
            });
        }
        let envelope: Envelope<T> = serde_json::from_str(raw)?;
        Ok(envelope.payload)
    }
}
