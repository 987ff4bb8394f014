//! Engine configuration.
//!
//! All knobs are plain serde-deserializable fields with defaults, so hosts
//! can load them from the environment (the daemon uses the `config` crate)
//! or construct them in code.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Execution strategy for a ready batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// Run ready nodes concurrently (the default).
    #[default]
    Parallel,
    /// Run ready nodes one at a time, for debugging.
    Sequential,
}

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// TTL of result-cache entries, in seconds.
    #[serde(default = "default_result_cache_ttl_s")]
    pub result_cache_ttl_s: u64,

    /// Heartbeat write period for running nodes, in seconds.
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,

    /// Staleness threshold for recovery to reclassify a running node, in
    /// seconds. The effective threshold is never below five heartbeat
    /// intervals.
    #[serde(default = "default_heartbeat_stale_s")]
    pub heartbeat_stale_s: u64,

    /// TTL of the per-execution decide lock, in seconds.
    #[serde(default = "default_decide_lock_ttl_s")]
    pub decide_lock_ttl_s: u64,

    /// Recovery sweep period, in seconds.
    #[serde(default = "default_sweeper_interval_s")]
    pub sweeper_interval_s: u64,

    /// Default per-node handler timeout, in seconds.
    #[serde(default = "default_node_default_timeout_s")]
    pub node_default_timeout_s: u64,

    /// Whether ready batches run concurrently or one node at a time.
    #[serde(default)]
    pub executor_mode: ExecutorMode,

    /// Engine-wide retry policy overrides by node type.
    #[serde(default)]
    pub retry_overrides: HashMap<String, RetryPolicy>,
}

fn default_result_cache_ttl_s() -> u64 {
    3600
}

fn default_heartbeat_interval_s() -> u64 {
    20
}

fn default_heartbeat_stale_s() -> u64 {
    300
}

fn default_decide_lock_ttl_s() -> u64 {
    60
}

fn default_sweeper_interval_s() -> u64 {
    60
}

fn default_node_default_timeout_s() -> u64 {
    600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            result_cache_ttl_s: default_result_cache_ttl_s(),
            heartbeat_interval_s: default_heartbeat_interval_s(),
            heartbeat_stale_s: default_heartbeat_stale_s(),
            decide_lock_ttl_s: default_decide_lock_ttl_s(),
            sweeper_interval_s: default_sweeper_interval_s(),
            node_default_timeout_s: default_node_default_timeout_s(),
            executor_mode: ExecutorMode::default(),
            retry_overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// TTL of result-cache entries.
    #[must_use]
    pub fn result_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.result_cache_ttl_s)
    }

    /// Heartbeat write period.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    /// TTL on heartbeat keys: three write periods.
    #[must_use]
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s.saturating_mul(3))
    }

    /// Effective staleness threshold: the configured value, floored at five
    /// heartbeat intervals.
    #[must_use]
    pub fn heartbeat_stale(&self) -> Duration {
        Duration::from_secs(
            self.heartbeat_stale_s
                .max(self.heartbeat_interval_s.saturating_mul(5)),
        )
    }

    /// TTL of the decide lock.
    #[must_use]
    pub fn decide_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.decide_lock_ttl_s)
    }

    /// Recovery sweep period.
    #[must_use]
    pub fn sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper_interval_s)
    }

    /// Default per-node handler timeout.
    #[must_use]
    pub fn node_default_timeout(&self) -> Duration {
        Duration::from_secs(self.node_default_timeout_s)
    }
}
