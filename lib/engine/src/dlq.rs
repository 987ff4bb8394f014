//! Dead-letter queue views.
//!
//! The DLQ is a persistent, cross-execution failure log; entries are never
//! garbage-collected automatically. Listing composes the three store
//! indices (global, per-workflow, per-node-type); replay lives on the
//! engine facade because it needs the runner.

use crate::cache::ExecutionCache;
use crate::error::EngineError;
use crate::model::DlqEntry;
use chrono::{DateTime, Utc};
use conflux_core::{DlqEntryId, WorkflowId};
use std::collections::HashMap;
use std::sync::Arc;

/// Filter for listing and purging DLQ entries.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    /// Restrict to one workflow.
    pub workflow_id: Option<WorkflowId>,
    /// Restrict to one node type.
    pub node_type: Option<String>,
    /// Only entries created before this instant.
    pub older_than: Option<DateTime<Utc>>,
    /// Cap the number of entries returned. Ignored by purge.
    pub limit: Option<usize>,
}

/// Aggregate statistics over the DLQ.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DlqStats {
    /// Total number of entries.
    pub total: usize,
    /// Entry counts by workflow id.
    pub by_workflow: HashMap<String, usize>,
    /// Entry counts by node type.
    pub by_node_type: HashMap<String, usize>,
    /// Creation time of the oldest entry.
    pub oldest: Option<DateTime<Utc>>,
    /// Creation time of the newest entry.
    pub newest: Option<DateTime<Utc>>,
}

pub(crate) struct DeadLetterQueue {
    cache: Arc<ExecutionCache>,
}

impl DeadLetterQueue {
    pub(crate) fn new(cache: Arc<ExecutionCache>) -> Self {
        Self { cache }
    }

    /// Lists entries matching the filter, oldest first.
    pub(crate) async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, EngineError> {
        let ids = match (&filter.workflow_id, &filter.node_type) {
            (Some(workflow_id), Some(node_type)) => {
                let by_workflow = self.cache.dlq_ids_for_workflow(workflow_id).await?;
                let by_type = self.cache.dlq_ids_for_node_type(node_type).await?;
                by_workflow
                    .into_iter()
                    .filter(|id| by_type.contains(id))
                    .collect()
            }
            (Some(workflow_id), None) => self.cache.dlq_ids_for_workflow(workflow_id).await?,
            (None, Some(node_type)) => self.cache.dlq_ids_for_node_type(node_type).await?,
            (None, None) => self.cache.dlq_ids().await?,
        };

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            // Entries removed between the index read and here just drop out.
            if let Some(entry) = self.cache.dlq_get(&id).await? {
                entries.push(entry);
            }
        }

        if let Some(older_than) = filter.older_than {
            entries.retain(|entry| entry.created_at < older_than);
        }
        entries.sort_by_key(|entry| entry.created_at);
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Reads one entry.
    pub(crate) async fn get(&self, entry_id: &DlqEntryId) -> Result<Option<DlqEntry>, EngineError> {
        self.cache.dlq_get(entry_id).await
    }

    /// Removes one entry. Returns false if it did not exist.
    pub(crate) async fn remove(&self, entry_id: &DlqEntryId) -> Result<bool, EngineError> {
        let Some(entry) = self.cache.dlq_get(entry_id).await? else {
            return Ok(false);
        };
        self.cache.dlq_remove(&entry).await
    }

    /// Removes every entry matching the filter; returns the count removed.
    pub(crate) async fn purge(&self, filter: &DlqFilter) -> Result<usize, EngineError> {
        let unlimited = DlqFilter {
            limit: None,
            ..filter.clone()
        };
        let entries = self.list(&unlimited).await?;
        let mut removed = 0;
        for entry in &entries {
            if self.cache.dlq_remove(entry).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Computes aggregate statistics over all entries.
    pub(crate) async fn stats(&self) -> Result<DlqStats, EngineError> {
        let entries = self.list(&DlqFilter::default()).await?;
        let mut stats = DlqStats {
            total: entries.len(),
            ..DlqStats::default()
        };
        for entry in &entries {
            *stats
                .by_workflow
                .entry(entry.workflow_id.to_string())
                .or_default() += 1;
            *stats
                .by_node_type
                .entry(entry.node_type.clone())
                .or_default() += 1;
        }
        stats.oldest = entries.first().map(|entry| entry.created_at);
        stats.newest = entries.last().map(|entry| entry.created_at);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::{NodeError, NodeErrorKind, NodeId};
    use conflux_core::ExecutionId;
    use conflux_store::MemoryStore;

    fn dlq() -> DeadLetterQueue {
        let cache = Arc::new(ExecutionCache::new(
            Arc::new(MemoryStore::new()),
            &EngineConfig::default(),
        ));
        DeadLetterQueue::new(cache)
    }

    fn entry(workflow_id: WorkflowId, node_type: &str, age_s: i64) -> DlqEntry {
        let at = Utc::now() - chrono::TimeDelta::seconds(age_s);
        DlqEntry {
            entry_id: DlqEntryId::new(),
            execution_id: ExecutionId::new(),
            workflow_id,
            node_id: NodeId::from("n"),
            node_type: node_type.to_string(),
            error: NodeError {
                kind: NodeErrorKind::Permanent,
                message: "boom".to_string(),
            },
            inputs: serde_json::Map::new(),
            retry_count: 3,
            created_at: at,
            last_error_at: at,
        }
    }

    #[tokio::test]
    async fn list_filters_by_workflow_and_node_type() {
        let dlq = dlq();
        let wf_a = WorkflowId::new();
        let wf_b = WorkflowId::new();

        let http_a = entry(wf_a, "http", 30);
        let llm_a = entry(wf_a, "llm", 20);
        let http_b = entry(wf_b, "http", 10);
        for e in [&http_a, &llm_a, &http_b] {
            dlq.cache.dlq_put(e).await.unwrap();
        }

        assert_eq!(dlq.list(&DlqFilter::default()).await.unwrap().len(), 3);

        let for_wf_a = dlq
            .list(&DlqFilter {
                workflow_id: Some(wf_a),
                ..DlqFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(for_wf_a.len(), 2);

        let http_only = dlq
            .list(&DlqFilter {
                node_type: Some("http".to_string()),
                ..DlqFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(http_only.len(), 2);

        let http_in_a = dlq
            .list(&DlqFilter {
                workflow_id: Some(wf_a),
                node_type: Some("http".to_string()),
                ..DlqFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(http_in_a.len(), 1);
        assert_eq!(http_in_a[0].entry_id, http_a.entry_id);
    }

    #[tokio::test]
    async fn list_sorts_oldest_first_and_limits() {
        let dlq = dlq();
        let wf = WorkflowId::new();
        let old = entry(wf, "http", 100);
        let new = entry(wf, "http", 1);
        dlq.cache.dlq_put(&new).await.unwrap();
        dlq.cache.dlq_put(&old).await.unwrap();

        let all = dlq.list(&DlqFilter::default()).await.unwrap();
        assert_eq!(all[0].entry_id, old.entry_id);

        let limited = dlq
            .list(&DlqFilter {
                limit: Some(1),
                ..DlqFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].entry_id, old.entry_id);
    }

    #[tokio::test]
    async fn purge_honors_older_than() {
        let dlq = dlq();
        let wf = WorkflowId::new();
        let old = entry(wf, "http", 3600);
        let new = entry(wf, "http", 1);
        dlq.cache.dlq_put(&old).await.unwrap();
        dlq.cache.dlq_put(&new).await.unwrap();

        let removed = dlq
            .purge(&DlqFilter {
                older_than: Some(Utc::now() - chrono::TimeDelta::seconds(60)),
                ..DlqFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = dlq.list(&DlqFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entry_id, new.entry_id);
    }

    #[tokio::test]
    async fn stats_aggregate_by_workflow_and_type() {
        let dlq = dlq();
        let wf_a = WorkflowId::new();
        let wf_b = WorkflowId::new();
        dlq.cache.dlq_put(&entry(wf_a, "http", 50)).await.unwrap();
        dlq.cache.dlq_put(&entry(wf_a, "llm", 40)).await.unwrap();
        dlq.cache.dlq_put(&entry(wf_b, "http", 30)).await.unwrap();

        let stats = dlq.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_workflow.get(&wf_a.to_string()), Some(&2));
        assert_eq!(stats.by_node_type.get("http"), Some(&2));
        assert!(stats.oldest <= stats.newest);
    }

    #[tokio::test]
    async fn remove_missing_entry_is_false() {
        let dlq = dlq();
        assert!(!dlq.remove(&DlqEntryId::new()).await.unwrap());
    }
}
