//! Fault-tolerant workflow execution engine.
//!
//! Workflows are directed acyclic graphs of typed nodes connected by edges.
//! The engine plans execution layers, runs independent nodes concurrently,
//! persists every state transition to a shared store, survives process
//! crashes via heartbeats and a recovery sweeper, deduplicates repeat work
//! through input-hashed result caching, and quarantines exhausted failures
//! in a dead-letter queue.
//!
//! - **Model**: [`model::ExecutionContext`] and friends
//! - **Planning**: [`planner`] (Kahn layers, readiness, conditional skips)
//! - **Conditions**: [`condition`] (edge predicates over upstream outputs)
//! - **Templates**: [`template`] (`{{node.path}}` parameter references)
//! - **Persistence**: [`cache::ExecutionCache`] over a [`conflux_store::Store`]
//! - **Ports**: [`handler::NodeHandler`] in, [`emitter::StatusEmitter`] out
//! - **Facade**: [`engine::Engine`]

pub mod cache;
pub mod condition;
pub mod config;
pub mod digest;
pub mod dlq;
pub mod emitter;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod model;
pub mod planner;
pub mod retry;
pub mod template;

mod executor;
mod recovery;
mod runner;

pub use condition::{Condition, ConditionOp};
pub use config::{EngineConfig, ExecutorMode};
pub use dlq::{DlqFilter, DlqStats};
pub use emitter::{NullEmitter, StatusEmitter, StatusKind};
pub use engine::{Engine, ExecutionRequest};
pub use error::{EngineError, ValidationError};
pub use handler::{EchoHandler, HandlerError, HandlerRegistry, NodeContext, NodeHandler};
pub use model::{
    DlqEntry, EdgeDefinition, Event, EventType, ExecutionContext, ExecutionOptions,
    ExecutionStatus, NodeDefinition, NodeError, NodeErrorKind, NodeExecution, NodeId, NodeStatus,
};
pub use retry::RetryPolicy;
