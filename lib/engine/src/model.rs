//! Execution data model.
//!
//! An [`ExecutionContext`] is one run of a workflow: the frozen definition
//! (nodes and edges), per-node execution records, collected outputs, the
//! planned layers, and run-level status and timing. Node and output maps are
//! persisted as separate store hashes, so they are skipped when the context
//! header is serialized.

use crate::condition::Condition;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use conflux_core::{DlqEntryId, ExecutionId, SessionId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// A workflow-author-chosen node identifier, unique within one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::borrow::Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created but not yet picked up by a decide loop.
    Pending,
    /// Actively executing.
    Running,
    /// Suspended by an operator; reserved, the executor never sets it.
    Paused,
    /// All nodes reached a terminal status without failures.
    Completed,
    /// A failed node blocked completion, or the execution got stuck.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The status of a single node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for its dependencies.
    Pending,
    /// Claimed by a decide iteration, not yet running.
    Scheduled,
    /// Handler invocation in flight.
    Running,
    /// Handler returned successfully.
    Completed,
    /// Handler failed permanently or exhausted retries.
    Failed,
    /// Satisfied from the result cache without a handler invocation.
    Cached,
    /// Aborted by execution cancellation.
    Cancelled,
    /// All incoming edges were dead; never ran.
    Skipped,
    /// Reserved for trigger-style nodes that block on external events.
    /// The executor itself never assigns it.
    Waiting,
}

impl NodeStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cached | Self::Cancelled | Self::Skipped
        )
    }

    /// Returns true if a node in this status is claimed by a runner or a
    /// decide iteration.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

/// One node of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique id within the workflow.
    pub id: NodeId,
    /// Handler type key, e.g. `"http"`.
    pub node_type: String,
    /// Author-supplied parameters; may contain `{{node.path}}` references.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl NodeDefinition {
    /// Creates a node definition.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            parameters: Map::new(),
        }
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// A directed dependency between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    /// The upstream node.
    pub source: NodeId,
    /// The downstream node.
    pub target: NodeId,
    /// Editor-facing source port, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Editor-facing target port, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    /// Predicate over the source's output; a false condition kills the edge
    /// for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl EdgeDefinition {
    /// Creates an unconditional edge.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            condition: None,
        }
    }

    /// Attaches a condition to the edge.
    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Classification of a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    /// Worth retrying.
    Transient,
    /// Retrying cannot help.
    Permanent,
    /// The handler exceeded its per-node timeout.
    Timeout,
    /// Aborted by cancellation.
    Cancelled,
}

/// A node failure with its classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    /// Failure classification.
    pub kind: NodeErrorKind,
    /// Human-readable message from the handler.
    pub message: String,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One failed attempt, recorded on the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedError {
    /// The node that failed.
    pub node_id: NodeId,
    /// The failure message.
    pub message: String,
    /// 1-based attempt number within the invocation.
    pub attempt: u32,
    /// When the attempt failed.
    pub at: DateTime<Utc>,
}

/// Execution state of one node within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// The node this record belongs to.
    pub node_id: NodeId,
    /// The node's handler type.
    pub node_type: String,
    /// Current status.
    pub status: NodeStatus,
    /// Digest of the resolved inputs of the latest invocation.
    pub input_hash: Option<String>,
    /// Output of a successful invocation.
    pub output: Option<Value>,
    /// Final error of a failed invocation.
    pub error: Option<NodeError>,
    /// When the node was claimed by a decide iteration.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the latest invocation started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Total retries across attempts and recoveries.
    pub retry_count: u32,
    /// Last heartbeat written while running.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// Creates a pending record for a node.
    #[must_use]
    pub fn new(node_id: NodeId, node_type: impl Into<String>) -> Self {
        Self {
            node_id,
            node_type: node_type.into(),
            status: NodeStatus::Pending,
            input_hash: None,
            output: None,
            error: None,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_heartbeat_at: None,
        }
    }

    /// Marks the node as claimed by a decide iteration.
    pub fn schedule(&mut self, at: DateTime<Utc>) {
        self.status = NodeStatus::Scheduled;
        self.scheduled_at = Some(at);
    }

    /// Marks an invocation as started.
    pub fn start(&mut self, at: DateTime<Utc>) {
        self.status = NodeStatus::Running;
        self.started_at = Some(at);
        self.last_heartbeat_at = Some(at);
    }

    /// Marks the node as completed with its output.
    pub fn complete(&mut self, at: DateTime<Utc>, output: Value) {
        self.status = NodeStatus::Completed;
        self.completed_at = Some(at);
        self.output = Some(output);
        self.error = None;
    }

    /// Marks the node as satisfied from the result cache.
    pub fn complete_cached(&mut self, at: DateTime<Utc>, output: Value) {
        self.status = NodeStatus::Cached;
        self.completed_at = Some(at);
        self.output = Some(output);
        self.error = None;
    }

    /// Marks the node as failed.
    pub fn fail(&mut self, at: DateTime<Utc>, error: NodeError) {
        self.status = NodeStatus::Failed;
        self.completed_at = Some(at);
        self.error = Some(error);
    }

    /// Marks the node as cancelled.
    pub fn cancel(&mut self, at: DateTime<Utc>) {
        self.status = NodeStatus::Cancelled;
        self.completed_at = Some(at);
    }

    /// Marks the node as skipped without running it.
    pub fn skip(&mut self, at: DateTime<Utc>) {
        self.status = NodeStatus::Skipped;
        self.completed_at = Some(at);
    }

    /// Returns the node to pending after its runner was presumed dead.
    ///
    /// Counts as a retry; the in-flight timestamps are cleared so a fresh
    /// invocation starts clean.
    pub fn reset_to_pending(&mut self) {
        self.status = NodeStatus::Pending;
        self.retry_count += 1;
        self.scheduled_at = None;
        self.started_at = None;
        self.last_heartbeat_at = None;
    }
}

/// Per-execution options supplied at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Whether successful node outputs are served from the result cache.
    #[serde(default = "default_caching")]
    pub caching: bool,
    /// Per-node-type retry policy overrides for this execution.
    #[serde(default)]
    pub retry_overrides: HashMap<String, RetryPolicy>,
}

fn default_caching() -> bool {
    true
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            caching: default_caching(),
            retry_overrides: HashMap::new(),
        }
    }
}

/// One run of a workflow.
///
/// `nodes` and `edges` are frozen for the lifetime of the execution. Every
/// node in `nodes` has a record in `node_executions`. The two maps are
/// persisted as separate store hashes and therefore skipped by serde: the
/// serialized form of this struct is exactly the state header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique id of this run.
    pub execution_id: ExecutionId,
    /// The workflow definition this run belongs to.
    pub workflow_id: WorkflowId,
    /// The session that started the run.
    pub session_id: SessionId,
    /// Overall status.
    pub status: ExecutionStatus,
    /// Frozen node definitions.
    pub nodes: Vec<NodeDefinition>,
    /// Frozen edges.
    pub edges: Vec<EdgeDefinition>,
    /// Kahn layers computed at creation.
    pub execution_order: Vec<Vec<NodeId>>,
    /// Options supplied at start.
    pub options: ExecutionOptions,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the run state last changed.
    pub updated_at: DateTime<Utc>,
    /// Failed attempts, in occurrence order.
    pub errors: Vec<RecordedError>,
    /// Per-node execution records, persisted separately.
    #[serde(skip)]
    pub node_executions: HashMap<NodeId, NodeExecution>,
    /// Node outputs for template and condition resolution, persisted
    /// separately.
    #[serde(skip)]
    pub outputs: HashMap<NodeId, Value>,
}

impl ExecutionContext {
    /// Creates a pending execution with a fresh id.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        session_id: SessionId,
        nodes: Vec<NodeDefinition>,
        edges: Vec<EdgeDefinition>,
        execution_order: Vec<Vec<NodeId>>,
        options: ExecutionOptions,
    ) -> Self {
        let now = Utc::now();
        let node_executions = nodes
            .iter()
            .map(|node| {
                (
                    node.id.clone(),
                    NodeExecution::new(node.id.clone(), node.node_type.clone()),
                )
            })
            .collect();

        Self {
            execution_id: ExecutionId::new(),
            workflow_id,
            session_id,
            status: ExecutionStatus::Pending,
            nodes,
            edges,
            execution_order,
            options,
            started_at: now,
            completed_at: None,
            updated_at: now,
            errors: Vec::new(),
            node_executions,
            outputs: HashMap::new(),
        }
    }

    /// Returns the definition of a node by id.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|node| &node.id == node_id)
    }

    /// Returns true if every node is in a terminal status.
    #[must_use]
    pub fn all_nodes_terminal(&self) -> bool {
        self.node_executions
            .values()
            .all(|exec| exec.status.is_terminal())
    }

    /// Returns true if any node failed.
    #[must_use]
    pub fn any_node_failed(&self) -> bool {
        self.node_executions
            .values()
            .any(|exec| exec.status == NodeStatus::Failed)
    }

    /// Returns true if any node is scheduled or running.
    #[must_use]
    pub fn any_node_in_flight(&self) -> bool {
        self.node_executions
            .values()
            .any(|exec| exec.status.is_in_flight())
    }

    /// Fraction of nodes in a terminal status, in `0.0..=1.0`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.node_executions.is_empty() {
            return 1.0;
        }
        let terminal = self
            .node_executions
            .values()
            .filter(|exec| exec.status.is_terminal())
            .count();
        terminal as f64 / self.node_executions.len() as f64
    }
}

/// One entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Unique entry id.
    pub entry_id: DlqEntryId,
    /// The execution the failure happened in.
    pub execution_id: ExecutionId,
    /// The workflow the execution belongs to.
    pub workflow_id: WorkflowId,
    /// The failed node.
    pub node_id: NodeId,
    /// The failed node's handler type.
    pub node_type: String,
    /// The final error.
    pub error: NodeError,
    /// The resolved inputs of the failed invocation, for replay.
    pub inputs: Map<String, Value>,
    /// Retry count at the time of quarantine.
    pub retry_count: u32,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the node last failed (updated by failed replays).
    pub last_error_at: DateTime<Utc>,
}

/// Event kinds appended to an execution's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeCached,
    NodeSkipped,
    NodeRetried,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    DlqAdded,
    TaskCompleted,
}

/// An append-only event on an execution's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// When the event was appended.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload.
    pub payload: Value,
}

impl Event {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_node_context() -> ExecutionContext {
        ExecutionContext::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![
                NodeDefinition::new("a", "emit"),
                NodeDefinition::new("b", "echo"),
            ],
            vec![EdgeDefinition::new("a", "b")],
            vec![vec![NodeId::from("a")], vec![NodeId::from("b")]],
            ExecutionOptions::default(),
        )
    }

    #[test]
    fn every_node_gets_an_execution_record() {
        let ctx = two_node_context();
        assert_eq!(ctx.node_executions.len(), 2);
        for node in &ctx.nodes {
            assert!(ctx.node_executions.contains_key(&node.id));
        }
    }

    #[test]
    fn node_lifecycle() {
        let mut exec = NodeExecution::new(NodeId::from("a"), "emit");
        assert_eq!(exec.status, NodeStatus::Pending);

        let now = Utc::now();
        exec.schedule(now);
        assert_eq!(exec.status, NodeStatus::Scheduled);

        exec.start(now);
        assert_eq!(exec.status, NodeStatus::Running);
        assert!(exec.last_heartbeat_at.is_some());

        exec.complete(now, json!({"v": 1}));
        assert_eq!(exec.status, NodeStatus::Completed);
        assert!(exec.status.is_terminal());
        assert_eq!(exec.output, Some(json!({"v": 1})));
    }

    #[test]
    fn reset_counts_as_retry_and_clears_in_flight_state() {
        let mut exec = NodeExecution::new(NodeId::from("a"), "emit");
        let now = Utc::now();
        exec.schedule(now);
        exec.start(now);

        exec.reset_to_pending();
        assert_eq!(exec.status, NodeStatus::Pending);
        assert_eq!(exec.retry_count, 1);
        assert!(exec.started_at.is_none());
        assert!(exec.last_heartbeat_at.is_none());
    }

    #[test]
    fn skipped_is_terminal_without_running() {
        let mut exec = NodeExecution::new(NodeId::from("a"), "emit");
        exec.skip(Utc::now());
        assert_eq!(exec.status, NodeStatus::Skipped);
        assert!(exec.status.is_terminal());
        assert!(exec.started_at.is_none());
    }

    #[test]
    fn execution_status_terminality() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn header_serialization_skips_node_and_output_maps() {
        let mut ctx = two_node_context();
        ctx.outputs.insert(NodeId::from("a"), json!({"v": 1}));

        let json = serde_json::to_value(&ctx).expect("serialize");
        assert!(json.get("node_executions").is_none());
        assert!(json.get("outputs").is_none());
        assert!(json.get("execution_id").is_some());
        assert!(json.get("nodes").is_some());
    }

    #[test]
    fn progress_counts_terminal_nodes() {
        let mut ctx = two_node_context();
        assert_eq!(ctx.progress(), 0.0);

        let a = NodeId::from("a");
        if let Some(exec) = ctx.node_executions.get_mut(&a) {
            exec.complete(Utc::now(), json!({}));
        }
        assert!((ctx.progress() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_context_reports_full_progress() {
        let ctx = ExecutionContext::new(
            WorkflowId::new(),
            SessionId::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            ExecutionOptions::default(),
        );
        assert_eq!(ctx.progress(), 1.0);
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_string(&EventType::NodeRetried).expect("serialize");
        assert_eq!(json, "\"node_retried\"");
    }
}
