//! The node handler port.
//!
//! Concrete node behaviors (HTTP, LLM calls, messaging, device control) live
//! outside the engine. Each node type maps to one [`NodeHandler`] in a
//! string-keyed registry built at engine startup; the engine is oblivious to
//! a handler's internals beyond this contract.
//!
//! Handlers may be invoked more than once for the same
//! `(execution, node, input_hash)` if the engine crashes between a successful
//! invocation and the result-cache write becoming observable. Idempotency
//! beyond the cache hit is the handler's responsibility, as is thread
//! safety: the engine promises no isolation between invocations.

use crate::model::{NodeId, NodeError, NodeErrorKind};
use async_trait::async_trait;
use conflux_core::{ExecutionId, SessionId, WorkflowId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Failure modes a handler can signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth retrying per the node's retry policy.
    Transient { message: String },
    /// Retrying cannot help; the node fails and is quarantined.
    Permanent { message: String },
    /// The handler decided it ran out of time. The engine also enforces its
    /// own per-node timeout around the invocation.
    Timeout { message: String },
}

impl HandlerError {
    /// Convenience constructor for transient failures.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Convenience constructor for permanent failures.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient handler error: {message}"),
            Self::Permanent { message } => write!(f, "permanent handler error: {message}"),
            Self::Timeout { message } => write!(f, "handler timeout: {message}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<HandlerError> for NodeError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Transient { message } => NodeError {
                kind: NodeErrorKind::Transient,
                message,
            },
            HandlerError::Permanent { message } => NodeError {
                kind: NodeErrorKind::Permanent,
                message,
            },
            HandlerError::Timeout { message } => NodeError {
                kind: NodeErrorKind::Timeout,
                message,
            },
        }
    }
}

/// Read-only execution view passed to handlers.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// The session the execution belongs to.
    pub session_id: SessionId,
    /// The execution id.
    pub execution_id: ExecutionId,
    /// Outputs of upstream nodes, by node id.
    pub upstream_outputs: HashMap<NodeId, Value>,
    /// Cancelled when the execution is cancelled; handlers should honor it
    /// at cooperative points.
    pub cancellation: CancellationToken,
}

/// The unit of work for one node type.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Executes a node with fully resolved inputs.
    ///
    /// The output must be serializable by the store's serializer.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] classifying the failure.
    async fn execute(
        &self,
        node_id: &NodeId,
        node_type: &str,
        inputs: &Map<String, Value>,
        ctx: &NodeContext,
    ) -> Result<Value, HandlerError>;
}

/// String-keyed handler registry, built once at engine startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a node type, replacing any previous one.
    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    /// Returns the handler for a node type.
    #[must_use]
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    /// Returns true if a handler is registered for the node type.
    #[must_use]
    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Returns the registered node types, sorted.
    #[must_use]
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// A handler that returns its resolved inputs as the output.
///
/// Useful for wiring tests and smoke-checking a deployment.
pub struct EchoHandler;

#[async_trait]
impl NodeHandler for EchoHandler {
    async fn execute(
        &self,
        _node_id: &NodeId,
        _node_type: &str,
        inputs: &Map<String, Value>,
        _ctx: &NodeContext,
    ) -> Result<Value, HandlerError> {
        Ok(Value::Object(inputs.clone()))
    }
}
