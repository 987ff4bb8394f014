//! Per-node runner: template resolution, result-cache short-circuit, the
//! retry loop, heartbeats, timeout, and dead-letter hand-off.
//!
//! The runner persists every node transition through the cache and appends
//! the matching event after the state write. It never lets a handler error
//! escape: the outcome of a run is always a terminal `NodeExecution` record.

use crate::cache::ExecutionCache;
use crate::config::EngineConfig;
use crate::digest;
use crate::emitter::{StatusEmitter, StatusKind};
use crate::handler::{HandlerRegistry, NodeContext};
use crate::model::{
    DlqEntry, Event, EventType, ExecutionContext, NodeDefinition, NodeError, NodeErrorKind,
    NodeExecution, RecordedError,
};
use crate::retry;
use crate::template;
use chrono::Utc;
use conflux_core::DlqEntryId;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The result of running one node to a terminal status.
pub(crate) struct RunOutcome {
    /// The node's final execution record.
    pub node: NodeExecution,
    /// The output, for completed and cached runs.
    pub output: Option<Value>,
    /// One record per failed attempt, in order.
    pub errors: Vec<RecordedError>,
}

pub(crate) struct NodeRunner {
    cache: Arc<ExecutionCache>,
    registry: Arc<HandlerRegistry>,
    emitter: Arc<dyn StatusEmitter>,
    config: EngineConfig,
}

impl NodeRunner {
    pub(crate) fn new(
        cache: Arc<ExecutionCache>,
        registry: Arc<HandlerRegistry>,
        emitter: Arc<dyn StatusEmitter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            cache,
            registry,
            emitter,
            config,
        }
    }

    /// Runs one ready node: resolves templates, consults the result cache,
    /// then enters the retry loop.
    pub(crate) async fn run(
        &self,
        ctx: &ExecutionContext,
        node: &NodeDefinition,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, crate::error::EngineError> {
        let mut exec = ctx
            .node_executions
            .get(&node.id)
            .cloned()
            .unwrap_or_else(|| NodeExecution::new(node.id.clone(), node.node_type.clone()));

        let resolved = template::resolve_parameters(&node.parameters, &ctx.outputs);
        let input_hash = digest::input_hash(&resolved);
        exec.input_hash = Some(input_hash.clone());

        if ctx.options.caching
            && let Some(output) = self
                .cache
                .result_get(&ctx.workflow_id, &node.id, &input_hash)
                .await?
        {
            let now = Utc::now();
            exec.complete_cached(now, output.clone());
            self.cache.save_node(&ctx.execution_id, &exec).await?;
            self.cache
                .save_output(&ctx.execution_id, &node.id, &output)
                .await?;
            self.cache
                .append_event(
                    &ctx.execution_id,
                    &Event::new(
                        EventType::NodeCached,
                        json!({"node_id": node.id, "input_hash": input_hash}),
                    ),
                )
                .await?;
            self.emitter
                .emit(
                    &ctx.execution_id,
                    Some(&node.id),
                    StatusKind::NodeStatusChanged,
                    json!({"status": "cached"}),
                )
                .await;
            self.emitter
                .emit(
                    &ctx.execution_id,
                    Some(&node.id),
                    StatusKind::NodeOutputAvailable,
                    output.clone(),
                )
                .await;
            return Ok(RunOutcome {
                node: exec,
                output: Some(output),
                errors: Vec::new(),
            });
        }

        self.run_resolved(ctx, node, exec, resolved, input_hash, cancel, true)
            .await
    }

    /// The retry loop over already-resolved inputs.
    ///
    /// Also the entry point for dead-letter replays, which re-run the stored
    /// inputs without template resolution or a cache lookup, and with
    /// `quarantine` off so a failed replay updates its existing entry
    /// instead of minting a duplicate.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_resolved(
        &self,
        ctx: &ExecutionContext,
        node: &NodeDefinition,
        mut exec: NodeExecution,
        resolved: Map<String, Value>,
        input_hash: String,
        cancel: CancellationToken,
        quarantine: bool,
    ) -> Result<RunOutcome, crate::error::EngineError> {
        let policy = retry::resolve_policy(
            &node.node_type,
            &ctx.options.retry_overrides,
            &self.config.retry_overrides,
        );
        let mut errors = Vec::new();

        let Some(handler) = self.registry.get(&node.node_type) else {
            // Validated at start, so this only happens when the registry
            // changed under a recovered execution.
            let error = NodeError {
                kind: NodeErrorKind::Permanent,
                message: format!("no handler registered for node type {}", node.node_type),
            };
            errors.push(self.record(&mut exec, &error, 1));
            self.fail_node(ctx, node, &mut exec, &error).await?;
            if quarantine {
                self.quarantine(ctx, node, &exec, resolved, &error).await?;
            }
            return Ok(RunOutcome {
                node: exec,
                output: None,
                errors,
            });
        };

        exec.input_hash = Some(input_hash.clone());
        let base_retries = exec.retry_count;

        for attempt in 1..=policy.max_attempts.max(1) {
            if cancel.is_cancelled() {
                return self.cancelled(ctx, node, exec, errors).await;
            }

            let now = Utc::now();
            exec.start(now);
            exec.retry_count = base_retries + (attempt - 1);
            self.cache.save_node(&ctx.execution_id, &exec).await?;
            self.cache
                .write_heartbeat(&ctx.execution_id, &node.id, now)
                .await?;

            let (event_type, payload) = if attempt == 1 {
                (
                    EventType::NodeStarted,
                    json!({"node_id": node.id, "node_type": node.node_type}),
                )
            } else {
                (
                    EventType::NodeRetried,
                    json!({"node_id": node.id, "attempt": attempt, "reason": "handler_error"}),
                )
            };
            self.cache
                .append_event(&ctx.execution_id, &Event::new(event_type, payload))
                .await?;
            self.emitter
                .emit(
                    &ctx.execution_id,
                    Some(&node.id),
                    StatusKind::NodeStatusChanged,
                    json!({"status": "running", "attempt": attempt}),
                )
                .await;

            let heartbeat = self.spawn_heartbeat(ctx, node);
            let view = NodeContext {
                workflow_id: ctx.workflow_id,
                session_id: ctx.session_id,
                execution_id: ctx.execution_id,
                upstream_outputs: ctx.outputs.clone(),
                cancellation: cancel.child_token(),
            };
            let timeout = self.config.node_default_timeout();

            let invocation = tokio::select! {
                () = cancel.cancelled() => None,
                invoked = tokio::time::timeout(
                    timeout,
                    handler.execute(&node.id, &node.node_type, &resolved, &view),
                ) => Some(invoked),
            };

            heartbeat.abort();
            self.cache
                .clear_heartbeat(&ctx.execution_id, &node.id)
                .await?;

            let Some(invoked) = invocation else {
                return self.cancelled(ctx, node, exec, errors).await;
            };

            let error = match invoked {
                Ok(Ok(output)) => {
                    return self
                        .complete(ctx, node, exec, &input_hash, output, errors)
                        .await;
                }
                Ok(Err(e)) => NodeError::from(e),
                Err(_) => NodeError {
                    kind: NodeErrorKind::Timeout,
                    message: format!("handler exceeded timeout of {}s", timeout.as_secs()),
                },
            };

            errors.push(self.record(&mut exec, &error, attempt));

            if policy.is_retryable(error.kind) && attempt < policy.max_attempts {
                tokio::time::sleep(policy.delay_for(attempt + 1)).await;
                continue;
            }

            self.fail_node(ctx, node, &mut exec, &error).await?;
            if quarantine {
                self.quarantine(ctx, node, &exec, resolved, &error).await?;
            }
            return Ok(RunOutcome {
                node: exec,
                output: None,
                errors,
            });
        }

        // The loop always returns; max_attempts >= 1 guarantees one pass.
        Ok(RunOutcome {
            node: exec,
            output: None,
            errors,
        })
    }

    fn record(&self, exec: &mut NodeExecution, error: &NodeError, attempt: u32) -> RecordedError {
        tracing::warn!(
            node_id = %exec.node_id,
            kind = ?error.kind,
            attempt,
            "node attempt failed: {}",
            error.message
        );
        RecordedError {
            node_id: exec.node_id.clone(),
            message: error.message.clone(),
            attempt,
            at: Utc::now(),
        }
    }

    fn spawn_heartbeat(
        &self,
        ctx: &ExecutionContext,
        node: &NodeDefinition,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let execution_id = ctx.execution_id;
        let node_id = node.id.clone();
        let period = self.config.heartbeat_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The caller wrote the initial heartbeat; skip the immediate tick.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = cache
                    .write_heartbeat(&execution_id, &node_id, Utc::now())
                    .await
                {
                    tracing::warn!(
                        %execution_id,
                        %node_id,
                        error = %e,
                        "failed to write heartbeat"
                    );
                }
            }
        })
    }

    async fn complete(
        &self,
        ctx: &ExecutionContext,
        node: &NodeDefinition,
        mut exec: NodeExecution,
        input_hash: &str,
        output: Value,
        errors: Vec<RecordedError>,
    ) -> Result<RunOutcome, crate::error::EngineError> {
        let now = Utc::now();
        exec.complete(now, output.clone());
        self.cache.save_node(&ctx.execution_id, &exec).await?;
        self.cache
            .save_output(&ctx.execution_id, &node.id, &output)
            .await?;
        if ctx.options.caching {
            self.cache
                .result_put(&ctx.workflow_id, &node.id, input_hash, &output)
                .await?;
        }
        self.cache
            .append_event(
                &ctx.execution_id,
                &Event::new(
                    EventType::NodeCompleted,
                    json!({"node_id": node.id, "retry_count": exec.retry_count}),
                ),
            )
            .await?;
        self.emitter
            .emit(
                &ctx.execution_id,
                Some(&node.id),
                StatusKind::NodeStatusChanged,
                json!({"status": "completed"}),
            )
            .await;
        self.emitter
            .emit(
                &ctx.execution_id,
                Some(&node.id),
                StatusKind::NodeOutputAvailable,
                output.clone(),
            )
            .await;

        Ok(RunOutcome {
            node: exec,
            output: Some(output),
            errors,
        })
    }

    async fn cancelled(
        &self,
        ctx: &ExecutionContext,
        node: &NodeDefinition,
        mut exec: NodeExecution,
        errors: Vec<RecordedError>,
    ) -> Result<RunOutcome, crate::error::EngineError> {
        exec.cancel(Utc::now());
        self.cache.save_node(&ctx.execution_id, &exec).await?;
        self.emitter
            .emit(
                &ctx.execution_id,
                Some(&node.id),
                StatusKind::NodeStatusChanged,
                json!({"status": "cancelled"}),
            )
            .await;
        Ok(RunOutcome {
            node: exec,
            output: None,
            errors,
        })
    }

    /// Marks the node failed in state and on the event stream.
    async fn fail_node(
        &self,
        ctx: &ExecutionContext,
        node: &NodeDefinition,
        exec: &mut NodeExecution,
        error: &NodeError,
    ) -> Result<(), crate::error::EngineError> {
        let now = Utc::now();
        exec.fail(now, error.clone());
        self.cache.save_node(&ctx.execution_id, exec).await?;
        self.cache
            .append_event(
                &ctx.execution_id,
                &Event::new(
                    EventType::NodeFailed,
                    json!({
                        "node_id": node.id,
                        "error": error,
                        "retry_count": exec.retry_count,
                    }),
                ),
            )
            .await?;
        self.emitter
            .emit(
                &ctx.execution_id,
                Some(&node.id),
                StatusKind::NodeStatusChanged,
                json!({"status": "failed", "error": error.message}),
            )
            .await;
        Ok(())
    }

    /// Quarantines a failed node in the dead-letter queue.
    async fn quarantine(
        &self,
        ctx: &ExecutionContext,
        node: &NodeDefinition,
        exec: &NodeExecution,
        inputs: Map<String, Value>,
        error: &NodeError,
    ) -> Result<(), crate::error::EngineError> {
        let now = Utc::now();
        let entry = DlqEntry {
            entry_id: DlqEntryId::new(),
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            error: error.clone(),
            inputs,
            // Attempts made, not retries: the first try counts.
            retry_count: exec.retry_count + 1,
            created_at: now,
            last_error_at: now,
        };
        self.cache.dlq_put(&entry).await?;
        self.cache
            .append_event(
                &ctx.execution_id,
                &Event::new(
                    EventType::DlqAdded,
                    json!({"entry_id": entry.entry_id, "node_id": node.id}),
                ),
            )
            .await?;
        self.emitter
            .emit(
                &ctx.execution_id,
                Some(&node.id),
                StatusKind::DlqAdded,
                json!({"entry_id": entry.entry_id}),
            )
            .await;
        Ok(())
    }
}
