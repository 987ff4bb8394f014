//! The decide loop.
//!
//! At most one decide iteration per execution runs at a time, across all
//! processes: every iteration starts by taking the execution's decide lock.
//! One iteration loads state, skips dead branches, schedules the ready
//! batch, runs it, persists the results, and releases the lock; the driver
//! re-enters until the execution is terminal or someone else owns the round.
//!
//! Failure posture inside the lock: handler errors never escape the retry
//! wrapper; a lost lock mid-batch is tolerated because all writes are
//! idempotent and the next decider simply observes whatever landed; a
//! crashed decider leaves `SCHEDULED`/`RUNNING` nodes for the recovery
//! sweeper to reclaim via heartbeats.

use crate::cache::{ExecutionCache, decide_lock_key};
use crate::config::{EngineConfig, ExecutorMode};
use crate::emitter::{StatusEmitter, StatusKind};
use crate::error::EngineError;
use crate::handler::HandlerRegistry;
use crate::model::{Event, EventType, ExecutionContext, ExecutionStatus};
use crate::planner;
use crate::runner::{NodeRunner, RunOutcome};
use chrono::Utc;
use conflux_core::ExecutionId;
use conflux_store::{DistributedLock, LockError, Store};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_STORE_RETRIES: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecideOutcome {
    /// More work may be ready; re-enter the loop.
    Continue,
    /// Terminal, idle, or another decider owns the round.
    Settled,
}

pub(crate) struct Executor {
    cache: Arc<ExecutionCache>,
    emitter: Arc<dyn StatusEmitter>,
    config: EngineConfig,
    locks: DistributedLock,
    runner: NodeRunner,
    cancellations: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

impl Executor {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        cache: Arc<ExecutionCache>,
        registry: Arc<HandlerRegistry>,
        emitter: Arc<dyn StatusEmitter>,
        config: EngineConfig,
    ) -> Self {
        let runner = NodeRunner::new(
            Arc::clone(&cache),
            registry,
            Arc::clone(&emitter),
            config.clone(),
        );
        Self {
            cache,
            emitter,
            config,
            locks: DistributedLock::new(store),
            runner,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn runner(&self) -> &NodeRunner {
        &self.runner
    }

    /// Returns the cancellation token for an execution, creating it if
    /// needed.
    pub(crate) fn cancellation(&self, execution_id: &ExecutionId) -> CancellationToken {
        let mut map = match self.cancellations.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(*execution_id).or_default().clone()
    }

    /// Signals every in-flight task of an execution to abort.
    pub(crate) fn signal_cancel(&self, execution_id: &ExecutionId) {
        self.cancellation(execution_id).cancel();
    }

    pub(crate) fn drop_cancellation(&self, execution_id: &ExecutionId) {
        let mut map = match self.cancellations.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(execution_id);
    }

    /// Drives the execution until it is terminal, idle, or owned elsewhere.
    ///
    /// Store outages are retried with bounded backoff; a persistent outage
    /// fails the execution with reason `store_unavailable` (best effort) and
    /// surfaces the error.
    pub(crate) async fn drive(&self, execution_id: &ExecutionId) -> Result<(), EngineError> {
        let mut store_failures: u32 = 0;
        loop {
            match self.decide_once(execution_id).await {
                Ok(DecideOutcome::Continue) => store_failures = 0,
                Ok(DecideOutcome::Settled) => return Ok(()),
                Err(EngineError::Store(e)) if store_failures < MAX_STORE_RETRIES => {
                    store_failures += 1;
                    let delay = STORE_RETRY_DELAY * 2u32.saturating_pow(store_failures - 1);
                    tracing::warn!(
                        %execution_id,
                        error = %e,
                        attempt = store_failures,
                        "store unavailable during decide, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if matches!(e, EngineError::Store(_)) {
                        self.fail_for_store_outage(execution_id).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One decide iteration under the execution's lock.
    async fn decide_once(&self, execution_id: &ExecutionId) -> Result<DecideOutcome, EngineError> {
        let lock = match self
            .locks
            .acquire(&decide_lock_key(execution_id), self.config.decide_lock_ttl())
            .await
        {
            Ok(lock) => lock,
            // A concurrent decider owns this round.
            Err(LockError::Unavailable { .. }) => return Ok(DecideOutcome::Settled),
            Err(LockError::Store(e)) => return Err(e.into()),
        };

        let outcome = self.decide_locked(execution_id).await;

        if let Err(e) = lock.release().await {
            tracing::warn!(%execution_id, error = %e, "failed to release decide lock");
        }
        outcome
    }

    async fn decide_locked(&self, execution_id: &ExecutionId) -> Result<DecideOutcome, EngineError> {
        let Some(mut ctx) = self.cache.load(execution_id).await? else {
            return Err(EngineError::ExecutionNotFound {
                execution_id: *execution_id,
            });
        };
        if ctx.status.is_terminal() {
            self.drop_cancellation(execution_id);
            return Ok(DecideOutcome::Settled);
        }

        let ready_set = planner::find_ready(&ctx);

        let now = Utc::now();
        for node_id in &ready_set.skipped {
            if let Some(exec) = ctx.node_executions.get_mut(node_id) {
                exec.skip(now);
                let exec = exec.clone();
                self.cache.save_node(execution_id, &exec).await?;
                self.cache
                    .append_event(
                        execution_id,
                        &Event::new(EventType::NodeSkipped, json!({"node_id": node_id})),
                    )
                    .await?;
                self.emitter
                    .emit(
                        execution_id,
                        Some(node_id),
                        StatusKind::NodeStatusChanged,
                        json!({"status": "skipped"}),
                    )
                    .await;
            }
        }

        if ready_set.ready.is_empty() {
            if !ready_set.skipped.is_empty() {
                // Skipping may have unblocked successors; rescan.
                ctx.updated_at = now;
                self.cache.save_state(&ctx).await?;
                return Ok(DecideOutcome::Continue);
            }
            if ctx.any_node_in_flight() {
                // Another process owns the batch; heartbeats arbitrate.
                return Ok(DecideOutcome::Settled);
            }
            self.finalize(&mut ctx).await?;
            return Ok(DecideOutcome::Settled);
        }

        for node_id in &ready_set.ready {
            if let Some(exec) = ctx.node_executions.get_mut(node_id) {
                exec.schedule(now);
                let exec = exec.clone();
                self.cache.save_node(execution_id, &exec).await?;
            }
        }
        ctx.updated_at = now;
        self.cache.save_state(&ctx).await?;

        let cancel = self.cancellation(execution_id);
        let batch: Vec<_> = ready_set
            .ready
            .iter()
            .filter_map(|node_id| ctx.node(node_id))
            .collect();

        let outcomes: Vec<Result<RunOutcome, EngineError>> = match self.config.executor_mode {
            ExecutorMode::Parallel => {
                futures::future::join_all(
                    batch
                        .iter()
                        .map(|node| self.runner.run(&ctx, node, cancel.clone())),
                )
                .await
            }
            ExecutorMode::Sequential => {
                let mut outcomes = Vec::with_capacity(batch.len());
                for node in &batch {
                    outcomes.push(self.runner.run(&ctx, node, cancel.clone()).await);
                }
                outcomes
            }
        };

        for outcome in outcomes {
            let outcome = outcome?;
            if let Some(output) = &outcome.output {
                ctx.outputs.insert(outcome.node.node_id.clone(), output.clone());
            }
            ctx.errors.extend(outcome.errors);
            ctx.node_executions
                .insert(outcome.node.node_id.clone(), outcome.node);
        }
        ctx.updated_at = Utc::now();

        // The execution may have been cancelled while the batch ran; never
        // overwrite a terminal header with this iteration's running copy.
        if let Some(status) = self.cache.load_status(execution_id).await?
            && status.is_terminal()
        {
            self.drop_cancellation(execution_id);
            return Ok(DecideOutcome::Settled);
        }
        self.cache.save_state(&ctx).await?;

        Ok(DecideOutcome::Continue)
    }

    /// Settles an execution with no ready and no in-flight nodes.
    async fn finalize(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        // Replaying a completed execution's decide loop is a no-op.
        if let Some(status) = self.cache.load_status(&ctx.execution_id).await?
            && status.is_terminal()
        {
            return Ok(());
        }

        let (status, event_type, reason) = if ctx.any_node_failed() {
            (
                ExecutionStatus::Failed,
                EventType::WorkflowFailed,
                Some("node_failures"),
            )
        } else if ctx.all_nodes_terminal() {
            (ExecutionStatus::Completed, EventType::WorkflowCompleted, None)
        } else {
            // Terminal-but-not-satisfying predecessors with nothing left to
            // falsify: the execution cannot make progress.
            (
                ExecutionStatus::Failed,
                EventType::WorkflowFailed,
                Some("stuck"),
            )
        };

        let now = Utc::now();
        ctx.status = status;
        ctx.completed_at = Some(now);
        ctx.updated_at = now;
        self.cache.save_state(ctx).await?;
        self.cache.active_remove(&ctx.execution_id).await?;

        let mut payload = json!({"status": status});
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        self.cache
            .append_event(&ctx.execution_id, &Event::new(event_type, payload.clone()))
            .await?;
        self.emitter
            .emit(
                &ctx.execution_id,
                None,
                StatusKind::WorkflowStatusChanged,
                payload,
            )
            .await;
        self.drop_cancellation(&ctx.execution_id);

        tracing::info!(
            execution_id = %ctx.execution_id,
            status = ?ctx.status,
            "execution settled"
        );
        Ok(())
    }

    async fn fail_for_store_outage(&self, execution_id: &ExecutionId) {
        let result: Result<(), EngineError> = async {
            let Some(mut ctx) = self.cache.load(execution_id).await? else {
                return Ok(());
            };
            if ctx.status.is_terminal() {
                return Ok(());
            }
            let now = Utc::now();
            ctx.status = ExecutionStatus::Failed;
            ctx.completed_at = Some(now);
            ctx.updated_at = now;
            self.cache.save_state(&ctx).await?;
            self.cache.active_remove(execution_id).await?;
            self.cache
                .append_event(
                    execution_id,
                    &Event::new(
                        EventType::WorkflowFailed,
                        json!({"status": "failed", "reason": "store_unavailable"}),
                    ),
                )
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                %execution_id,
                error = %e,
                "could not record store outage on execution"
            );
        }
    }
}
