//! Execution persistence over the store.
//!
//! The cache owns the engine's keyspace and nothing else: it serializes,
//! namespaces, and versions every value, but contains no scheduling logic.
//! Serializing decide iterations is the lock's job; the cache only promises
//! idempotent writes, so a retried iteration after a crash converges on the
//! same state.
//!
//! Keyspace:
//!
//! | key | value |
//! |---|---|
//! | `execution:{id}:state` | context header |
//! | `execution:{id}:nodes` | hash `node_id -> NodeExecution` |
//! | `execution:{id}:outputs` | hash `node_id -> output` |
//! | `execution:{id}:events` | event stream |
//! | `result:{workflow}:{node}:{hash}` | cached handler output, with TTL |
//! | `heartbeat:{execution}:{node}` | last heartbeat timestamp, with TTL |
//! | `lock:execution:{id}:decide` | decide-loop lock |
//! | `executions:active` | set of active execution ids |
//! | `dlq:entries:{id}` | DLQ entry hash |
//! | `dlq:all`, `dlq:workflow:{id}`, `dlq:node_type:{t}` | DLQ indices |
//!
//! Write ordering: state and node-hash updates land before the event that
//! describes them, so an event never claims a transition that is not yet
//! visible in state. Event streams are not capped by the engine; operators
//! may bound them out-of-band.

use crate::config::EngineConfig;
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::model::{DlqEntry, Event, ExecutionContext, ExecutionStatus, NodeExecution, NodeId};
use chrono::{DateTime, Utc};
use conflux_core::{DlqEntryId, ExecutionId, WorkflowId};
use conflux_store::Store;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const ACTIVE_SET_KEY: &str = "executions:active";
const DLQ_ALL_KEY: &str = "dlq:all";
const EVENT_FIELD: &str = "event";

fn state_key(execution_id: &ExecutionId) -> String {
    format!("execution:{execution_id}:state")
}

fn nodes_key(execution_id: &ExecutionId) -> String {
    format!("execution:{execution_id}:nodes")
}

fn outputs_key(execution_id: &ExecutionId) -> String {
    format!("execution:{execution_id}:outputs")
}

fn events_key(execution_id: &ExecutionId) -> String {
    format!("execution:{execution_id}:events")
}

fn result_key(workflow_id: &WorkflowId, node_id: &NodeId, input_hash: &str) -> String {
    format!("result:{workflow_id}:{node_id}:{input_hash}")
}

fn heartbeat_key(execution_id: &ExecutionId, node_id: &NodeId) -> String {
    format!("heartbeat:{execution_id}:{node_id}")
}

/// Name of an execution's decide-loop lock.
pub fn decide_lock_key(execution_id: &ExecutionId) -> String {
    format!("lock:execution:{execution_id}:decide")
}

fn dlq_entry_key(entry_id: &DlqEntryId) -> String {
    format!("dlq:entries:{entry_id}")
}

fn dlq_workflow_key(workflow_id: &WorkflowId) -> String {
    format!("dlq:workflow:{workflow_id}")
}

fn dlq_node_type_key(node_type: &str) -> String {
    format!("dlq:node_type:{node_type}")
}

/// Persistence layer for executions, results, heartbeats, events, and the
/// dead-letter queue.
pub struct ExecutionCache {
    store: Arc<dyn Store>,
    result_cache_ttl: Duration,
    heartbeat_ttl: Duration,
}

impl ExecutionCache {
    /// Creates a cache over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
        Self {
            store,
            result_cache_ttl: config.result_cache_ttl(),
            heartbeat_ttl: config.heartbeat_ttl(),
        }
    }

    // --- execution state ---

    /// Persists the context header.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or serialization fails.
    pub async fn save_state(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        self.store
            .set(&state_key(&ctx.execution_id), &Envelope::encode(ctx)?)
            .await?;
        Ok(())
    }

    /// Reads only the status from the persisted header.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or deserialization fails.
    pub async fn load_status(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionStatus>, EngineError> {
        let Some(raw) = self.store.get(&state_key(execution_id)).await? else {
            return Ok(None);
        };
        let header: ExecutionContext = Envelope::decode(&raw)?;
        Ok(Some(header.status))
    }

    /// Loads a full execution: header plus node and output hashes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or deserialization fails.
    pub async fn load(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionContext>, EngineError> {
        let Some(raw) = self.store.get(&state_key(execution_id)).await? else {
            return Ok(None);
        };
        let mut ctx: ExecutionContext = Envelope::decode(&raw)?;

        let mut node_executions = HashMap::new();
        for (field, raw) in self.store.hash_get_all(&nodes_key(execution_id)).await? {
            let exec: NodeExecution = Envelope::decode(&raw)?;
            node_executions.insert(NodeId::from(field), exec);
        }
        ctx.node_executions = node_executions;

        let mut outputs = HashMap::new();
        for (field, raw) in self.store.hash_get_all(&outputs_key(execution_id)).await? {
            let output: Value = Envelope::decode(&raw)?;
            outputs.insert(NodeId::from(field), output);
        }
        ctx.outputs = outputs;

        Ok(Some(ctx))
    }

    /// Persists one node's execution record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or serialization fails.
    pub async fn save_node(
        &self,
        execution_id: &ExecutionId,
        exec: &NodeExecution,
    ) -> Result<(), EngineError> {
        self.store
            .hash_set(
                &nodes_key(execution_id),
                exec.node_id.as_str(),
                &Envelope::encode(exec)?,
            )
            .await?;
        Ok(())
    }

    /// Persists one node's output.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or serialization fails.
    pub async fn save_output(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        output: &Value,
    ) -> Result<(), EngineError> {
        self.store
            .hash_set(
                &outputs_key(execution_id),
                node_id.as_str(),
                &Envelope::encode(output)?,
            )
            .await?;
        Ok(())
    }

    // --- result cache ---

    /// Looks up a cached result for the given input hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or deserialization fails.
    pub async fn result_get(
        &self,
        workflow_id: &WorkflowId,
        node_id: &NodeId,
        input_hash: &str,
    ) -> Result<Option<Value>, EngineError> {
        let raw = self
            .store
            .get(&result_key(workflow_id, node_id, input_hash))
            .await?;
        raw.map(|raw| Envelope::decode(&raw)).transpose()
    }

    /// Writes a successful handler output to the result cache.
    ///
    /// Only success writes here; error paths never touch the result cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or serialization fails.
    pub async fn result_put(
        &self,
        workflow_id: &WorkflowId,
        node_id: &NodeId,
        input_hash: &str,
        output: &Value,
    ) -> Result<(), EngineError> {
        self.store
            .set_with_ttl(
                &result_key(workflow_id, node_id, input_hash),
                &Envelope::encode(output)?,
                self.result_cache_ttl,
            )
            .await?;
        Ok(())
    }

    // --- events ---

    /// Appends an event to the execution's stream.
    ///
    /// Callers persist the corresponding state change first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or serialization fails.
    pub async fn append_event(
        &self,
        execution_id: &ExecutionId,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.store
            .stream_append(
                &events_key(execution_id),
                &[(EVENT_FIELD.to_string(), Envelope::encode(event)?)],
            )
            .await?;
        Ok(())
    }

    /// Reads the event stream in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or deserialization fails.
    pub async fn events(
        &self,
        execution_id: &ExecutionId,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, EngineError> {
        let entries = self
            .store
            .stream_range(&events_key(execution_id), None, limit)
            .await?;

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            for (field, raw) in &entry.fields {
                if field == EVENT_FIELD {
                    events.push(Envelope::decode(raw)?);
                }
            }
        }
        Ok(events)
    }

    // --- heartbeats ---

    /// Writes a node's heartbeat with the configured TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn write_heartbeat(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.store
            .set_with_ttl(
                &heartbeat_key(execution_id, node_id),
                &at.to_rfc3339(),
                self.heartbeat_ttl,
            )
            .await?;
        Ok(())
    }

    /// Reads a node's heartbeat, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the timestamp is unparsable.
    pub async fn read_heartbeat(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let Some(raw) = self
            .store
            .get(&heartbeat_key(execution_id, node_id))
            .await?
        else {
            return Ok(None);
        };
        let at = DateTime::parse_from_rfc3339(&raw).map_err(|e| EngineError::Serialization {
            message: format!("invalid heartbeat timestamp: {e}"),
        })?;
        Ok(Some(at.with_timezone(&Utc)))
    }

    /// Removes a node's heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn clear_heartbeat(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
    ) -> Result<(), EngineError> {
        self.store
            .delete(&heartbeat_key(execution_id, node_id))
            .await?;
        Ok(())
    }

    // --- active set ---

    /// Adds an execution to the active set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn active_add(&self, execution_id: &ExecutionId) -> Result<(), EngineError> {
        self.store
            .set_add(ACTIVE_SET_KEY, &execution_id.to_string())
            .await?;
        Ok(())
    }

    /// Removes an execution from the active set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn active_remove(&self, execution_id: &ExecutionId) -> Result<(), EngineError> {
        self.store
            .set_remove(ACTIVE_SET_KEY, &execution_id.to_string())
            .await?;
        Ok(())
    }

    /// Reads the active set. Unparsable members are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn active_ids(&self) -> Result<Vec<ExecutionId>, EngineError> {
        let members = self.store.set_members(ACTIVE_SET_KEY).await?;
        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            match member.parse::<ExecutionId>() {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!(member = %member, error = %e, "dropping invalid active-set member"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    // --- dead-letter queue ---

    /// Writes a DLQ entry and its three indices.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or serialization fails.
    pub async fn dlq_put(&self, entry: &DlqEntry) -> Result<(), EngineError> {
        let key = dlq_entry_key(&entry.entry_id);
        let Value::Object(fields) = serde_json::to_value(entry)? else {
            return Err(EngineError::Serialization {
                message: "dlq entry did not serialize to an object".to_string(),
            });
        };
        for (field, value) in &fields {
            self.store
                .hash_set(&key, field, &serde_json::to_string(value)?)
                .await?;
        }
        self.store
            .hash_set(&key, "version", &crate::envelope::CURRENT_VERSION.to_string())
            .await?;

        let entry_id = entry.entry_id.to_string();
        self.store.set_add(DLQ_ALL_KEY, &entry_id).await?;
        self.store
            .set_add(&dlq_workflow_key(&entry.workflow_id), &entry_id)
            .await?;
        self.store
            .set_add(&dlq_node_type_key(&entry.node_type), &entry_id)
            .await?;
        Ok(())
    }

    /// Reads a DLQ entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or deserialization fails.
    pub async fn dlq_get(&self, entry_id: &DlqEntryId) -> Result<Option<DlqEntry>, EngineError> {
        let fields = self.store.hash_get_all(&dlq_entry_key(entry_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut object = serde_json::Map::new();
        for (field, raw) in fields {
            if field == "version" {
                continue;
            }
            object.insert(field, serde_json::from_str(&raw)?);
        }
        Ok(Some(serde_json::from_value(Value::Object(object))?))
    }

    /// Removes a DLQ entry and its index memberships.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn dlq_remove(&self, entry: &DlqEntry) -> Result<bool, EngineError> {
        let entry_id = entry.entry_id.to_string();
        self.store.set_remove(DLQ_ALL_KEY, &entry_id).await?;
        self.store
            .set_remove(&dlq_workflow_key(&entry.workflow_id), &entry_id)
            .await?;
        self.store
            .set_remove(&dlq_node_type_key(&entry.node_type), &entry_id)
            .await?;
        let removed = self.store.delete(&dlq_entry_key(&entry.entry_id)).await?;
        Ok(removed)
    }

    /// Reads the global DLQ index.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn dlq_ids(&self) -> Result<Vec<DlqEntryId>, EngineError> {
        self.parse_dlq_index(self.store.set_members(DLQ_ALL_KEY).await?)
    }

    /// Reads the per-workflow DLQ index.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn dlq_ids_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<DlqEntryId>, EngineError> {
        self.parse_dlq_index(
            self.store
                .set_members(&dlq_workflow_key(workflow_id))
                .await?,
        )
    }

    /// Reads the per-node-type DLQ index.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn dlq_ids_for_node_type(
        &self,
        node_type: &str,
    ) -> Result<Vec<DlqEntryId>, EngineError> {
        self.parse_dlq_index(self.store.set_members(&dlq_node_type_key(node_type)).await?)
    }

    fn parse_dlq_index(&self, members: Vec<String>) -> Result<Vec<DlqEntryId>, EngineError> {
        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            match member.parse::<DlqEntryId>() {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!(member = %member, error = %e, "dropping invalid dlq index member"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
