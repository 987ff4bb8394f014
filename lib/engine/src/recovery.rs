//! Crash recovery.
//!
//! A runner that dies mid-node stops refreshing its heartbeat. The sweeper
//! walks the active set, resets any scheduled or running node whose
//! heartbeat is missing or stale back to pending, and re-drives the
//! execution. The same sweep runs once, synchronously, at process startup;
//! that is the only mechanism by which an execution crashed mid-batch
//! resumes.

use crate::cache::ExecutionCache;
use crate::config::EngineConfig;
use crate::emitter::{StatusEmitter, StatusKind};
use crate::error::EngineError;
use crate::executor::Executor;
use crate::model::{Event, EventType, NodeExecution};
use chrono::{DateTime, TimeDelta, Utc};
use conflux_core::ExecutionId;
use serde_json::json;
use std::sync::Arc;

pub(crate) struct RecoverySweeper {
    cache: Arc<ExecutionCache>,
    executor: Arc<Executor>,
    emitter: Arc<dyn StatusEmitter>,
    config: EngineConfig,
}

impl RecoverySweeper {
    pub(crate) fn new(
        cache: Arc<ExecutionCache>,
        executor: Arc<Executor>,
        emitter: Arc<dyn StatusEmitter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            cache,
            executor,
            emitter,
            config,
        }
    }

    /// Sweeps the active set once. Returns the number of executions that
    /// had nodes reset and were re-driven.
    pub(crate) async fn run_once(&self) -> usize {
        let ids = match self.cache.active_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "recovery sweep could not read active set");
                return 0;
            }
        };

        let mut redriven = 0;
        for execution_id in ids {
            match self.sweep_execution(&execution_id).await {
                Ok(true) => redriven += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(%execution_id, error = %e, "recovery sweep failed");
                }
            }
        }
        redriven
    }

    /// Spawns the periodic sweeper task.
    pub(crate) fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.config.sweeper_interval());
            // Startup recovery runs separately; skip the immediate tick.
            interval.tick().await;
            loop {
                interval.tick().await;
                let redriven = sweeper.run_once().await;
                if redriven > 0 {
                    tracing::info!(redriven, "recovery sweep re-drove executions");
                }
            }
        })
    }

    async fn sweep_execution(&self, execution_id: &ExecutionId) -> Result<bool, EngineError> {
        let Some(mut ctx) = self.cache.load(execution_id).await? else {
            // State is gone; the active-set member is an orphan.
            self.cache.active_remove(execution_id).await?;
            return Ok(false);
        };
        if ctx.status.is_terminal() {
            self.cache.active_remove(execution_id).await?;
            return Ok(false);
        }

        let now = Utc::now();
        let threshold = TimeDelta::from_std(self.config.heartbeat_stale())
            .unwrap_or_else(|_| TimeDelta::seconds(300));

        let mut reset_any = false;
        let stale_ids: Vec<_> = {
            let mut stale = Vec::new();
            for exec in ctx.node_executions.values() {
                if !exec.status.is_in_flight() {
                    continue;
                }
                let heartbeat = self.cache.read_heartbeat(execution_id, &exec.node_id).await?;
                if is_stale(exec, heartbeat, now, threshold) {
                    stale.push(exec.node_id.clone());
                }
            }
            stale
        };

        for node_id in stale_ids {
            let Some(exec) = ctx.node_executions.get_mut(&node_id) else {
                continue;
            };
            tracing::warn!(
                %execution_id,
                %node_id,
                "stale heartbeat, resetting node for retry"
            );
            exec.reset_to_pending();
            let exec = exec.clone();
            self.cache.save_node(execution_id, &exec).await?;
            self.cache.clear_heartbeat(execution_id, &node_id).await?;
            self.cache
                .append_event(
                    execution_id,
                    &Event::new(
                        EventType::NodeRetried,
                        json!({"node_id": node_id, "reason": "stale_heartbeat"}),
                    ),
                )
                .await?;
            self.emitter
                .emit(
                    execution_id,
                    Some(&node_id),
                    StatusKind::NodeStatusChanged,
                    json!({"status": "pending", "reason": "stale_heartbeat"}),
                )
                .await;
            reset_any = true;
        }

        if reset_any {
            ctx.updated_at = now;
            self.cache.save_state(&ctx).await?;
            self.executor.drive(execution_id).await?;
        }
        Ok(reset_any)
    }
}

/// A node is presumed dead when its heartbeat key is gone and nothing on the
/// record is fresher than the threshold. A fresh heartbeat always wins.
fn is_stale(
    exec: &NodeExecution,
    heartbeat: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: TimeDelta,
) -> bool {
    let last_sign_of_life = heartbeat
        .or(exec.last_heartbeat_at)
        .or(exec.started_at)
        .or(exec.scheduled_at);

    match last_sign_of_life {
        Some(at) => now.signed_duration_since(at) > threshold,
        // No heartbeat and no timestamps at all: nothing will ever refresh it.
        None => true,
    }
}
