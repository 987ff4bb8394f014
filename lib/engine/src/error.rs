//! Error types for the engine crate.
//!
//! - `ValidationError`: workflow definition problems, fatal at start.
//! - `EngineError`: everything the engine API can return. Store and lock
//!   failures are transient and recovered where possible; validation
//!   failures are not.

use conflux_core::{DlqEntryId, ExecutionId};
use conflux_store::{LockError, StoreError};
use std::fmt;

/// Workflow definition validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Two nodes share the same id.
    DuplicateNodeId { node_id: String },
    /// An edge references a node that is not in the definition.
    UnknownEdgeEndpoint { node_id: String },
    /// No handler is registered for a node's type.
    UnknownNodeType { node_id: String, node_type: String },
    /// The graph contains a cycle.
    CycleDetected,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNodeId { node_id } => {
                write!(f, "duplicate node id: {node_id}")
            }
            Self::UnknownEdgeEndpoint { node_id } => {
                write!(f, "edge references unknown node: {node_id}")
            }
            Self::UnknownNodeType { node_id, node_type } => {
                write!(f, "node {node_id} has unknown type: {node_type}")
            }
            Self::CycleDetected => write!(f, "workflow graph contains a cycle"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Errors returned by the engine API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The workflow definition is invalid. Fatal at `start_execution`.
    InvalidWorkflow(ValidationError),
    /// No execution with the given id exists in the store.
    ExecutionNotFound { execution_id: ExecutionId },
    /// An execution does not contain the named node.
    NodeNotFound {
        execution_id: ExecutionId,
        node_id: String,
    },
    /// No dead-letter entry with the given id exists.
    DlqEntryNotFound { entry_id: DlqEntryId },
    /// The backing store failed.
    Store(StoreError),
    /// A persisted value could not be encoded or decoded.
    Serialization { message: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWorkflow(e) => write!(f, "invalid workflow: {e}"),
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::NodeNotFound {
                execution_id,
                node_id,
            } => {
                write!(f, "node {node_id} not found in execution {execution_id}")
            }
            Self::DlqEntryNotFound { entry_id } => {
                write!(f, "dead-letter entry not found: {entry_id}")
            }
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Serialization { message } => write!(f, "serialization error: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        Self::InvalidWorkflow(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<LockError> for EngineError {
    fn from(e: LockError) -> Self {
        match e {
            // Lock contention is handled at the call sites that expect it;
            // anything that reaches this conversion is a store failure.
            LockError::Unavailable { name } => Self::Store(StoreError::Command {
                message: format!("lock unavailable: {name}"),
            }),
            LockError::Store(e) => Self::Store(e),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
