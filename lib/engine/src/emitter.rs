//! The status emitter port.
//!
//! The realtime transport (a WebSocket fanout in the surrounding product)
//! lives outside the engine; the engine only promises that every emission
//! happens after the state write it describes.

use crate::model::NodeId;
use async_trait::async_trait;
use conflux_core::ExecutionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status change categories pushed to the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    NodeStatusChanged,
    NodeOutputAvailable,
    WorkflowStatusChanged,
    DlqAdded,
}

/// Outbound status port.
#[async_trait]
pub trait StatusEmitter: Send + Sync {
    /// Emits one status update. Implementations must not fail the engine:
    /// delivery problems are theirs to swallow or log.
    async fn emit(
        &self,
        execution_id: &ExecutionId,
        node_id: Option<&NodeId>,
        kind: StatusKind,
        payload: Value,
    );
}

/// An emitter that drops everything; the default for embedded use.
pub struct NullEmitter;

#[async_trait]
impl StatusEmitter for NullEmitter {
    async fn emit(
        &self,
        _execution_id: &ExecutionId,
        _node_id: Option<&NodeId>,
        _kind: StatusKind,
        _payload: Value,
    ) {
    }
}
