//! The public engine facade.
//!
//! One `Engine` is instantiated per process with an injected store, handler
//! registry, and status emitter. It validates and starts executions, exposes
//! state snapshots and event streams, cancels, recovers, and administers the
//! dead-letter queue.
//!
//! `start_execution` drives the decide loop to quiescence before returning;
//! hosts that want fire-and-forget semantics spawn it.

use crate::cache::ExecutionCache;
use crate::config::EngineConfig;
use crate::digest;
use crate::dlq::{DeadLetterQueue, DlqFilter, DlqStats};
use crate::emitter::{StatusEmitter, StatusKind};
use crate::error::{EngineError, ValidationError};
use crate::executor::Executor;
use crate::handler::HandlerRegistry;
use crate::model::{
    DlqEntry, EdgeDefinition, Event, EventType, ExecutionContext, ExecutionOptions,
    ExecutionStatus, NodeDefinition, NodeStatus,
};
use crate::planner;
use crate::recovery::RecoverySweeper;
use chrono::Utc;
use conflux_core::{DlqEntryId, ExecutionId, SessionId, WorkflowId};
use conflux_store::Store;
use serde_json::json;
use std::sync::Arc;

/// Everything needed to start one execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The workflow definition id.
    pub workflow_id: WorkflowId,
    /// The session starting the run.
    pub session_id: SessionId,
    /// Node definitions.
    pub nodes: Vec<NodeDefinition>,
    /// Edges between them.
    pub edges: Vec<EdgeDefinition>,
    /// Per-execution options.
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    /// Creates a request with default options.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        session_id: SessionId,
        nodes: Vec<NodeDefinition>,
        edges: Vec<EdgeDefinition>,
    ) -> Self {
        Self {
            workflow_id,
            session_id,
            nodes,
            edges,
            options: ExecutionOptions::default(),
        }
    }
}

/// The workflow execution engine.
pub struct Engine {
    cache: Arc<ExecutionCache>,
    registry: Arc<HandlerRegistry>,
    emitter: Arc<dyn StatusEmitter>,
    executor: Arc<Executor>,
    recovery: Arc<RecoverySweeper>,
    dlq: DeadLetterQueue,
}

impl Engine {
    /// Builds an engine over the given store, handlers, and emitter.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        registry: HandlerRegistry,
        emitter: Arc<dyn StatusEmitter>,
        config: EngineConfig,
    ) -> Self {
        let cache = Arc::new(ExecutionCache::new(Arc::clone(&store), &config));
        let registry = Arc::new(registry);
        let executor = Arc::new(Executor::new(
            store,
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&emitter),
            config.clone(),
        ));
        let recovery = Arc::new(RecoverySweeper::new(
            Arc::clone(&cache),
            Arc::clone(&executor),
            Arc::clone(&emitter),
            config,
        ));
        let dlq = DeadLetterQueue::new(Arc::clone(&cache));

        Self {
            cache,
            registry,
            emitter,
            executor,
            recovery,
            dlq,
        }
    }

    /// Validates, persists, and runs a workflow execution.
    ///
    /// Returns once the decide loop is quiescent: the execution is terminal,
    /// or its remaining work is owned by another process.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidWorkflow`] for definition problems, or
    /// a store error.
    pub async fn start_execution(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionId, EngineError> {
        for node in &request.nodes {
            if !self.registry.contains(&node.node_type) {
                return Err(ValidationError::UnknownNodeType {
                    node_id: node.id.to_string(),
                    node_type: node.node_type.clone(),
                }
                .into());
            }
        }
        let execution_order = planner::plan(&request.nodes, &request.edges)?;

        let mut ctx = ExecutionContext::new(
            request.workflow_id,
            request.session_id,
            request.nodes,
            request.edges,
            execution_order,
            request.options,
        );
        let execution_id = ctx.execution_id;

        self.cache.save_state(&ctx).await?;
        for exec in ctx.node_executions.values() {
            self.cache.save_node(&execution_id, exec).await?;
        }
        self.cache.active_add(&execution_id).await?;

        ctx.status = ExecutionStatus::Running;
        ctx.updated_at = Utc::now();
        self.cache.save_state(&ctx).await?;
        self.cache
            .append_event(
                &execution_id,
                &Event::new(
                    EventType::WorkflowStarted,
                    json!({
                        "workflow_id": ctx.workflow_id,
                        "session_id": ctx.session_id,
                        "nodes": ctx.nodes.len(),
                    }),
                ),
            )
            .await?;
        self.emitter
            .emit(
                &execution_id,
                None,
                StatusKind::WorkflowStatusChanged,
                json!({"status": "running"}),
            )
            .await;

        tracing::info!(
            %execution_id,
            workflow_id = %ctx.workflow_id,
            nodes = ctx.nodes.len(),
            "starting execution"
        );

        self.executor.drive(&execution_id).await?;
        Ok(execution_id)
    }

    /// Re-enters the decide loop for an existing execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution does not exist or the store fails.
    pub async fn resume(&self, execution_id: &ExecutionId) -> Result<(), EngineError> {
        self.executor.drive(execution_id).await
    }

    /// Returns the current state snapshot: header, node states, outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution does not exist or the store fails.
    pub async fn get_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionContext, EngineError> {
        self.cache
            .load(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound {
                execution_id: *execution_id,
            })
    }

    /// Returns the execution's event stream in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn events(&self, execution_id: &ExecutionId) -> Result<Vec<Event>, EngineError> {
        self.cache.events(execution_id, None).await
    }

    /// Cancels an execution and signals its in-flight handlers to abort.
    ///
    /// Idempotent: cancelling a terminal execution returns its status
    /// without any further effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution does not exist or the store fails.
    pub async fn cancel(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionStatus, EngineError> {
        let Some(mut ctx) = self.cache.load(execution_id).await? else {
            return Err(EngineError::ExecutionNotFound {
                execution_id: *execution_id,
            });
        };
        if ctx.status.is_terminal() {
            return Ok(ctx.status);
        }

        let now = Utc::now();
        ctx.status = ExecutionStatus::Cancelled;
        ctx.completed_at = Some(now);
        ctx.updated_at = now;
        self.cache.save_state(&ctx).await?;
        self.cache.active_remove(execution_id).await?;
        self.cache
            .append_event(
                execution_id,
                &Event::new(EventType::WorkflowCancelled, json!({"status": "cancelled"})),
            )
            .await?;
        self.emitter
            .emit(
                execution_id,
                None,
                StatusKind::WorkflowStatusChanged,
                json!({"status": "cancelled"}),
            )
            .await;

        // The token entry stays registered until a decide iteration observes
        // the terminal status; in-flight batches fetch it by execution id.
        self.executor.signal_cancel(execution_id);

        tracing::info!(%execution_id, "execution cancelled");
        Ok(ExecutionStatus::Cancelled)
    }

    /// Returns the ids of executions in the active set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_active(&self) -> Result<Vec<ExecutionId>, EngineError> {
        self.cache.active_ids().await
    }

    /// Startup recovery: sweeps the active set once, synchronously.
    ///
    /// Returns the number of executions that were re-driven.
    pub async fn recover(&self) -> usize {
        self.recovery.run_once().await
    }

    /// Spawns the periodic recovery sweeper.
    #[must_use]
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.recovery.spawn()
    }

    // --- dead-letter queue ---

    /// Lists DLQ entries matching the filter, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_dlq(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, EngineError> {
        self.dlq.list(filter).await
    }

    /// Reads one DLQ entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry does not exist or the store fails.
    pub async fn get_dlq(&self, entry_id: &DlqEntryId) -> Result<DlqEntry, EngineError> {
        self.dlq
            .get(entry_id)
            .await?
            .ok_or(EngineError::DlqEntryNotFound {
                entry_id: *entry_id,
            })
    }

    /// Removes one DLQ entry. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn remove_dlq(&self, entry_id: &DlqEntryId) -> Result<bool, EngineError> {
        self.dlq.remove(entry_id).await
    }

    /// Removes every DLQ entry matching the filter; returns the count.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn purge_dlq(&self, filter: &DlqFilter) -> Result<usize, EngineError> {
        self.dlq.purge(filter).await
    }

    /// Aggregate DLQ statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn dlq_stats(&self) -> Result<DlqStats, EngineError> {
        self.dlq.stats().await
    }

    /// Replays a quarantined node with its stored inputs.
    ///
    /// Re-enters the retry loop for the same node and the same resolved
    /// inputs. On success the entry is removed, downstream work is
    /// re-driven, and `true` is returned; on another failure the entry's
    /// retry count and error are updated in place and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry or its execution no longer exists, or
    /// the store fails.
    pub async fn replay_dlq(&self, entry_id: &DlqEntryId) -> Result<bool, EngineError> {
        let entry = self.get_dlq(entry_id).await?;
        let Some(ctx) = self.cache.load(&entry.execution_id).await? else {
            return Err(EngineError::ExecutionNotFound {
                execution_id: entry.execution_id,
            });
        };
        let Some(node) = ctx.node(&entry.node_id).cloned() else {
            return Err(EngineError::NodeNotFound {
                execution_id: entry.execution_id,
                node_id: entry.node_id.to_string(),
            });
        };
        let Some(exec) = ctx.node_executions.get(&entry.node_id).cloned() else {
            return Err(EngineError::NodeNotFound {
                execution_id: entry.execution_id,
                node_id: entry.node_id.to_string(),
            });
        };

        tracing::info!(
            %entry_id,
            execution_id = %entry.execution_id,
            node_id = %entry.node_id,
            "replaying dead-letter entry"
        );

        let input_hash = digest::input_hash(&entry.inputs);
        let cancel = self.executor.cancellation(&entry.execution_id);
        let outcome = self
            .executor
            .runner()
            .run_resolved(
                &ctx,
                &node,
                exec,
                entry.inputs.clone(),
                input_hash,
                cancel,
                false,
            )
            .await?;

        if outcome.node.status == NodeStatus::Completed {
            self.cache.dlq_remove(&entry).await?;
            self.cache
                .append_event(
                    &entry.execution_id,
                    &Event::new(
                        EventType::TaskCompleted,
                        json!({"entry_id": entry.entry_id, "node_id": entry.node_id}),
                    ),
                )
                .await?;
            self.executor.drive(&entry.execution_id).await?;
            return Ok(true);
        }

        let mut updated = entry.clone();
        updated.retry_count = entry.retry_count + outcome.errors.len() as u32;
        updated.last_error_at = Utc::now();
        if let Some(error) = &outcome.node.error {
            updated.error = error.clone();
        }
        self.cache.dlq_put(&updated).await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, ConditionOp};
    use crate::emitter::NullEmitter;
    use crate::handler::{EchoHandler, HandlerError, NodeContext, NodeHandler};
    use crate::model::{NodeErrorKind, NodeId};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use conflux_store::MemoryStore;
    use serde_json::{Map, Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Returns `{"out": inputs["in"]}`.
    struct OutHandler;

    #[async_trait]
    impl NodeHandler for OutHandler {
        async fn execute(
            &self,
            _node_id: &NodeId,
            _node_type: &str,
            inputs: &Map<String, Value>,
            _ctx: &NodeContext,
        ) -> Result<Value, HandlerError> {
            Ok(json!({"out": inputs.get("in").cloned().unwrap_or(Value::Null)}))
        }
    }

    /// Counts invocations; returns `{"ok": true}`.
    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeHandler for CountingHandler {
        async fn execute(
            &self,
            _node_id: &NodeId,
            _node_type: &str,
            _inputs: &Map<String, Value>,
            _ctx: &NodeContext,
        ) -> Result<Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    /// Fails transiently a fixed number of times, then succeeds.
    struct FlakyHandler {
        failures_remaining: AtomicUsize,
    }

    impl FlakyHandler {
        fn failing(times: usize) -> Self {
            Self {
                failures_remaining: AtomicUsize::new(times),
            }
        }
    }

    #[async_trait]
    impl NodeHandler for FlakyHandler {
        async fn execute(
            &self,
            _node_id: &NodeId,
            _node_type: &str,
            _inputs: &Map<String, Value>,
            _ctx: &NodeContext,
        ) -> Result<Value, HandlerError> {
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(HandlerError::transient("connection reset"));
            }
            Ok(json!({"recovered": true}))
        }
    }

    /// Always fails with the given classification.
    struct FailingHandler {
        permanent: bool,
    }

    #[async_trait]
    impl NodeHandler for FailingHandler {
        async fn execute(
            &self,
            _node_id: &NodeId,
            _node_type: &str,
            _inputs: &Map<String, Value>,
            _ctx: &NodeContext,
        ) -> Result<Value, HandlerError> {
            if self.permanent {
                Err(HandlerError::permanent("unprocessable input"))
            } else {
                Err(HandlerError::transient("upstream flapping"))
            }
        }
    }

    /// Fails permanently until opened.
    struct GatedHandler {
        open: Arc<AtomicBool>,
    }

    #[async_trait]
    impl NodeHandler for GatedHandler {
        async fn execute(
            &self,
            _node_id: &NodeId,
            _node_type: &str,
            _inputs: &Map<String, Value>,
            _ctx: &NodeContext,
        ) -> Result<Value, HandlerError> {
            if self.open.load(Ordering::SeqCst) {
                Ok(json!({"unblocked": true}))
            } else {
                Err(HandlerError::permanent("gate closed"))
            }
        }
    }

    /// Sleeps long enough that only cancellation ends it in tests.
    struct BlockingHandler;

    #[async_trait]
    impl NodeHandler for BlockingHandler {
        async fn execute(
            &self,
            _node_id: &NodeId,
            _node_type: &str,
            _inputs: &Map<String, Value>,
            _ctx: &NodeContext,
        ) -> Result<Value, HandlerError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(json!({}))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_s: 0.01,
            backoff_multiplier: 2.0,
            max_delay_s: 0.1,
            retry_on_timeout: true,
        }
    }

    fn build_engine(register: impl FnOnce(&mut HandlerRegistry)) -> Arc<Engine> {
        let mut registry = HandlerRegistry::new();
        register(&mut registry);
        Arc::new(Engine::new(
            Arc::new(MemoryStore::new()),
            registry,
            Arc::new(NullEmitter),
            EngineConfig::default(),
        ))
    }

    fn event_kinds(events: &[Event]) -> Vec<EventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    fn node_status(ctx: &ExecutionContext, id: &str) -> NodeStatus {
        ctx.node_executions
            .get(id)
            .map(|exec| exec.status)
            .expect("node execution present")
    }

    #[tokio::test]
    async fn linear_chain_completes_with_ordered_events() {
        let engine = build_engine(|registry| {
            registry.register("emit", Arc::new(EchoHandler));
            registry.register("echo", Arc::new(OutHandler));
        });

        let request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![
                NodeDefinition::new("n1", "emit").with_parameter("v", json!("hi")),
                NodeDefinition::new("n2", "echo").with_parameter("in", json!("{{n1.v}}")),
            ],
            vec![EdgeDefinition::new("n1", "n2")],
        );

        let execution_id = engine.start_execution(request).await.unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(node_status(&ctx, "n1"), NodeStatus::Completed);
        assert_eq!(node_status(&ctx, "n2"), NodeStatus::Completed);
        assert_eq!(ctx.outputs.get("n2"), Some(&json!({"out": "hi"})));
        assert!(ctx.completed_at.is_some());
        assert!(engine.list_active().await.unwrap().is_empty());

        let events = engine.events(&execution_id).await.unwrap();
        assert_eq!(
            event_kinds(&events),
            vec![
                EventType::WorkflowStarted,
                EventType::NodeStarted,
                EventType::NodeCompleted,
                EventType::NodeStarted,
                EventType::NodeCompleted,
                EventType::WorkflowCompleted,
            ]
        );
        assert_eq!(events[1].payload["node_id"], json!("n1"));
        assert_eq!(events[3].payload["node_id"], json!("n2"));
    }

    #[tokio::test]
    async fn empty_workflow_completes_immediately() {
        let engine = build_engine(|_| {});
        let request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            Vec::new(),
            Vec::new(),
        );

        let execution_id = engine.start_execution(request).await.unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        let events = engine.events(&execution_id).await.unwrap();
        assert_eq!(
            event_kinds(&events),
            vec![EventType::WorkflowStarted, EventType::WorkflowCompleted]
        );
    }

    fn diamond_request(workflow_id: WorkflowId) -> ExecutionRequest {
        ExecutionRequest::new(
            workflow_id,
            SessionId::new(),
            vec![
                NodeDefinition::new("a", "count"),
                NodeDefinition::new("b", "count").with_parameter("src", json!("{{a.ok}}")),
                NodeDefinition::new("c", "count").with_parameter("src", json!("{{a.ok}}")),
                NodeDefinition::new("d", "count")
                    .with_parameter("left", json!("{{b.ok}}"))
                    .with_parameter("right", json!("{{c.ok}}")),
            ],
            vec![
                EdgeDefinition::new("a", "b"),
                EdgeDefinition::new("a", "c"),
                EdgeDefinition::new("b", "d"),
                EdgeDefinition::new("c", "d"),
            ],
        )
    }

    #[tokio::test]
    async fn diamond_completes_and_second_run_is_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = build_engine(|registry| {
            registry.register(
                "count",
                Arc::new(CountingHandler {
                    calls: Arc::clone(&calls),
                }),
            );
        });
        let workflow_id = WorkflowId::new();

        let first = engine
            .start_execution(diamond_request(workflow_id))
            .await
            .unwrap();
        let ctx = engine.get_execution(&first).await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Completed);
        for id in ["a", "b", "c", "d"] {
            assert_eq!(node_status(&ctx, id), NodeStatus::Completed);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // Same workflow, same parameters: every node is a cache hit and no
        // handler runs.
        let second = engine
            .start_execution(diamond_request(workflow_id))
            .await
            .unwrap();
        let ctx = engine.get_execution(&second).await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Completed);
        for id in ["a", "b", "c", "d"] {
            assert_eq!(node_status(&ctx, id), NodeStatus::Cached);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let events = engine.events(&second).await.unwrap();
        let cached = event_kinds(&events)
            .into_iter()
            .filter(|kind| *kind == EventType::NodeCached)
            .count();
        assert_eq!(cached, 4);
    }

    #[tokio::test]
    async fn caching_disabled_reruns_every_node() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = build_engine(|registry| {
            registry.register(
                "count",
                Arc::new(CountingHandler {
                    calls: Arc::clone(&calls),
                }),
            );
        });
        let workflow_id = WorkflowId::new();

        let mut request = diamond_request(workflow_id);
        request.options.caching = false;
        engine.start_execution(request).await.unwrap();

        let mut request = diamond_request(workflow_id);
        request.options.caching = false;
        engine.start_execution(request).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let engine = build_engine(|registry| {
            registry.register("http", Arc::new(FlakyHandler::failing(2)));
        });

        let mut request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![NodeDefinition::new("n", "http")],
            Vec::new(),
        );
        request
            .options
            .retry_overrides
            .insert("http".to_string(), fast_retry());

        let execution_id = engine.start_execution(request).await.unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        let exec = ctx.node_executions.get("n").unwrap();
        assert_eq!(exec.status, NodeStatus::Completed);
        assert_eq!(exec.retry_count, 2);
        assert_eq!(ctx.errors.len(), 2);

        let events = engine.events(&execution_id).await.unwrap();
        let kinds = event_kinds(&events);
        assert_eq!(
            kinds
                .iter()
                .filter(|kind| **kind == EventType::NodeStarted)
                .count(),
            1
        );
        assert_eq!(
            kinds
                .iter()
                .filter(|kind| **kind == EventType::NodeRetried)
                .count(),
            2
        );

        assert_eq!(engine.dlq_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn retry_exhaustion_quarantines_and_fails_the_workflow() {
        let engine = build_engine(|registry| {
            registry.register("http", Arc::new(FailingHandler { permanent: false }));
        });

        let mut request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![NodeDefinition::new("n", "http")],
            Vec::new(),
        );
        request
            .options
            .retry_overrides
            .insert("http".to_string(), fast_retry());

        let execution_id = engine.start_execution(request).await.unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();

        assert_eq!(ctx.status, ExecutionStatus::Failed);
        let exec = ctx.node_executions.get("n").unwrap();
        assert_eq!(exec.status, NodeStatus::Failed);
        assert!(exec.error.is_some());

        let entries = engine.list_dlq(&DlqFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.retry_count, 3);
        assert_eq!(entry.node_id, NodeId::from("n"));
        assert_eq!(entry.error.kind, NodeErrorKind::Transient);
        assert!(entry.error.message.contains("flapping"));

        let events = engine.events(&execution_id).await.unwrap();
        let kinds = event_kinds(&events);
        assert!(kinds.contains(&EventType::DlqAdded));
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::WorkflowFailed);
        assert_eq!(last.payload["reason"], json!("node_failures"));
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let engine = build_engine(|registry| {
            registry.register("http", Arc::new(FailingHandler { permanent: true }));
        });

        let mut request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![NodeDefinition::new("n", "http")],
            Vec::new(),
        );
        request
            .options
            .retry_overrides
            .insert("http".to_string(), fast_retry());

        let execution_id = engine.start_execution(request).await.unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Failed);

        let events = engine.events(&execution_id).await.unwrap();
        let kinds = event_kinds(&events);
        assert_eq!(
            kinds
                .iter()
                .filter(|kind| **kind == EventType::NodeRetried)
                .count(),
            0
        );

        let entries = engine.list_dlq(&DlqFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 1);
        assert_eq!(entries[0].error.kind, NodeErrorKind::Permanent);
    }

    #[tokio::test]
    async fn conditional_fork_skips_the_false_branch() {
        let engine = build_engine(|registry| {
            registry.register("emit", Arc::new(EchoHandler));
            registry.register("echo", Arc::new(OutHandler));
        });

        let request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![
                NodeDefinition::new("a", "emit").with_parameter("ok", json!(true)),
                NodeDefinition::new("b", "echo"),
                NodeDefinition::new("c", "echo"),
            ],
            vec![
                EdgeDefinition::new("a", "b").with_condition(Condition::compare(
                    "ok",
                    ConditionOp::Eq,
                    json!(true),
                )),
                EdgeDefinition::new("a", "c").with_condition(Condition::compare(
                    "ok",
                    ConditionOp::Eq,
                    json!(false),
                )),
            ],
        );

        let execution_id = engine.start_execution(request).await.unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();

        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(node_status(&ctx, "b"), NodeStatus::Completed);
        assert_eq!(node_status(&ctx, "c"), NodeStatus::Skipped);

        let events = engine.events(&execution_id).await.unwrap();
        let skipped: Vec<_> = events
            .iter()
            .filter(|event| event.event_type == EventType::NodeSkipped)
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].payload["node_id"], json!("c"));
    }

    #[tokio::test]
    async fn failed_node_blocks_downstream_and_fails_the_execution() {
        let engine = build_engine(|registry| {
            registry.register("bad", Arc::new(FailingHandler { permanent: true }));
            registry.register("echo", Arc::new(OutHandler));
        });

        let request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![
                NodeDefinition::new("a", "bad"),
                NodeDefinition::new("b", "echo"),
            ],
            vec![EdgeDefinition::new("a", "b")],
        );

        let execution_id = engine.start_execution(request).await.unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();

        assert_eq!(ctx.status, ExecutionStatus::Failed);
        assert_eq!(node_status(&ctx, "a"), NodeStatus::Failed);
        assert_eq!(node_status(&ctx, "b"), NodeStatus::Pending);

        // Only the failed node is quarantined.
        let entries = engine.list_dlq(&DlqFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node_id, NodeId::from("a"));
    }

    #[tokio::test]
    async fn invalid_workflows_are_rejected() {
        let engine = build_engine(|registry| {
            registry.register("echo", Arc::new(OutHandler));
        });
        let session_id = SessionId::new();

        let unknown_type = ExecutionRequest::new(
            WorkflowId::new(),
            session_id,
            vec![NodeDefinition::new("a", "teleport")],
            Vec::new(),
        );
        assert!(matches!(
            engine.start_execution(unknown_type).await,
            Err(EngineError::InvalidWorkflow(
                ValidationError::UnknownNodeType { .. }
            ))
        ));

        let cyclic = ExecutionRequest::new(
            WorkflowId::new(),
            session_id,
            vec![
                NodeDefinition::new("a", "echo"),
                NodeDefinition::new("b", "echo"),
            ],
            vec![EdgeDefinition::new("a", "b"), EdgeDefinition::new("b", "a")],
        );
        assert!(matches!(
            engine.start_execution(cyclic).await,
            Err(EngineError::InvalidWorkflow(ValidationError::CycleDetected))
        ));
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_nodes() {
        let engine = build_engine(|registry| {
            registry.register("block", Arc::new(BlockingHandler));
        });

        let request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![NodeDefinition::new("slow", "block")],
            Vec::new(),
        );

        let runner = Arc::clone(&engine);
        let task = tokio::spawn(async move { runner.start_execution(request).await });

        // Wait for the execution to land in the active set.
        let execution_id = loop {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Some(id) = engine.list_active().await.unwrap().first() {
                break *id;
            }
        };

        let status = engine.cancel(&execution_id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Cancelled);

        task.await.unwrap().unwrap();

        let ctx = engine.get_execution(&execution_id).await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Cancelled);
        assert_eq!(node_status(&ctx, "slow"), NodeStatus::Cancelled);

        let events = engine.events(&execution_id).await.unwrap();
        assert!(event_kinds(&events).contains(&EventType::WorkflowCancelled));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_executions() {
        let engine = build_engine(|registry| {
            registry.register("emit", Arc::new(EchoHandler));
        });

        let request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![NodeDefinition::new("a", "emit")],
            Vec::new(),
        );
        let execution_id = engine.start_execution(request).await.unwrap();

        let before = engine.events(&execution_id).await.unwrap().len();
        let status = engine.cancel(&execution_id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Completed);
        let after = engine.events(&execution_id).await.unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn cancel_unknown_execution_is_an_error() {
        let engine = build_engine(|_| {});
        assert!(matches!(
            engine.cancel(&ExecutionId::new()).await,
            Err(EngineError::ExecutionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn crash_recovery_resets_stale_nodes_and_finishes() {
        let engine = build_engine(|registry| {
            registry.register("emit", Arc::new(EchoHandler));
            registry.register("echo", Arc::new(OutHandler));
        });

        // Manufacture the state a crashed process would leave behind:
        // n1 done, n2 claimed and running with a heartbeat that went stale.
        let nodes = vec![
            NodeDefinition::new("n1", "emit").with_parameter("v", json!("hi")),
            NodeDefinition::new("n2", "echo").with_parameter("in", json!("{{n1.v}}")),
        ];
        let edges = vec![EdgeDefinition::new("n1", "n2")];
        let order = planner::plan(&nodes, &edges).unwrap();
        let mut ctx = ExecutionContext::new(
            WorkflowId::new(),
            SessionId::new(),
            nodes,
            edges,
            order,
            ExecutionOptions::default(),
        );
        ctx.status = ExecutionStatus::Running;
        let execution_id = ctx.execution_id;

        let long_ago = Utc::now() - chrono::TimeDelta::seconds(3600);
        if let Some(n1) = ctx.node_executions.get_mut("n1") {
            n1.schedule(long_ago);
            n1.start(long_ago);
            n1.complete(long_ago, json!({"v": "hi"}));
        }
        ctx.outputs.insert(NodeId::from("n1"), json!({"v": "hi"}));
        if let Some(n2) = ctx.node_executions.get_mut("n2") {
            n2.schedule(long_ago);
            n2.start(long_ago);
        }

        engine.cache.save_state(&ctx).await.unwrap();
        for exec in ctx.node_executions.values() {
            engine.cache.save_node(&execution_id, exec).await.unwrap();
        }
        engine
            .cache
            .save_output(&execution_id, &NodeId::from("n1"), &json!({"v": "hi"}))
            .await
            .unwrap();
        engine.cache.active_add(&execution_id).await.unwrap();

        // Startup recovery notices the stale heartbeat and re-drives.
        let redriven = engine.recover().await;
        assert_eq!(redriven, 1);

        let ctx = engine.get_execution(&execution_id).await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Completed);
        let n2 = ctx.node_executions.get("n2").unwrap();
        assert_eq!(n2.status, NodeStatus::Completed);
        assert!(n2.retry_count >= 1);
        assert_eq!(ctx.outputs.get("n2"), Some(&json!({"out": "hi"})));

        let events = engine.events(&execution_id).await.unwrap();
        let retried: Vec<_> = events
            .iter()
            .filter(|event| event.event_type == EventType::NodeRetried)
            .collect();
        assert!(
            retried
                .iter()
                .any(|event| event.payload["reason"] == json!("stale_heartbeat"))
        );
        assert!(engine.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_prunes_terminal_executions_from_the_active_set() {
        let engine = build_engine(|registry| {
            registry.register("emit", Arc::new(EchoHandler));
        });

        let request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![NodeDefinition::new("a", "emit")],
            Vec::new(),
        );
        let execution_id = engine.start_execution(request).await.unwrap();

        // Simulate a leftover member.
        engine.cache.active_add(&execution_id).await.unwrap();
        assert_eq!(engine.recover().await, 0);
        assert!(engine.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_dlq_reruns_the_node_and_removes_the_entry() {
        let open = Arc::new(AtomicBool::new(false));
        let engine = build_engine(|registry| {
            registry.register(
                "gated",
                Arc::new(GatedHandler {
                    open: Arc::clone(&open),
                }),
            );
        });

        let request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![NodeDefinition::new("n", "gated")],
            Vec::new(),
        );
        let execution_id = engine.start_execution(request).await.unwrap();
        let entries = engine.list_dlq(&DlqFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry_id = entries[0].entry_id;

        // Replay while still failing: the entry stays, with bumped counters.
        assert!(!engine.replay_dlq(&entry_id).await.unwrap());
        let entry = engine.get_dlq(&entry_id).await.unwrap();
        assert!(entry.retry_count >= 2);

        open.store(true, Ordering::SeqCst);
        assert!(engine.replay_dlq(&entry_id).await.unwrap());

        assert!(matches!(
            engine.get_dlq(&entry_id).await,
            Err(EngineError::DlqEntryNotFound { .. })
        ));
        let ctx = engine.get_execution(&execution_id).await.unwrap();
        assert_eq!(node_status(&ctx, "n"), NodeStatus::Completed);

        let events = engine.events(&execution_id).await.unwrap();
        assert!(event_kinds(&events).contains(&EventType::TaskCompleted));
    }

    #[tokio::test]
    async fn sequential_mode_still_completes_a_diamond() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(
            "count",
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            registry,
            Arc::new(NullEmitter),
            EngineConfig {
                executor_mode: crate::config::ExecutorMode::Sequential,
                ..EngineConfig::default()
            },
        );

        let execution_id = engine
            .start_execution(diamond_request(WorkflowId::new()))
            .await
            .unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn get_execution_reports_progress() {
        let engine = build_engine(|registry| {
            registry.register("emit", Arc::new(EchoHandler));
        });
        let request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![
                NodeDefinition::new("a", "emit"),
                NodeDefinition::new("b", "emit"),
            ],
            vec![EdgeDefinition::new("a", "b")],
        );
        let execution_id = engine.start_execution(request).await.unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();
        assert!((ctx.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn execution_options_roundtrip_through_the_store() {
        let engine = build_engine(|registry| {
            registry.register("emit", Arc::new(EchoHandler));
        });
        let mut request = ExecutionRequest::new(
            WorkflowId::new(),
            SessionId::new(),
            vec![NodeDefinition::new("a", "emit")],
            Vec::new(),
        );
        request.options.caching = false;
        let mut overrides = HashMap::new();
        overrides.insert("emit".to_string(), fast_retry());
        request.options.retry_overrides = overrides;

        let execution_id = engine.start_execution(request).await.unwrap();
        let ctx = engine.get_execution(&execution_id).await.unwrap();
        assert!(!ctx.options.caching);
        assert_eq!(
            ctx.options.retry_overrides.get("emit"),
            Some(&fast_retry())
        );
    }
}
