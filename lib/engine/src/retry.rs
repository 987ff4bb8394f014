//! Per-node-type retry policies.
//!
//! A policy bounds the number of handler attempts and spaces them with
//! capped exponential backoff. The delay before attempt `n` (1-indexed, so
//! the first retry is attempt 2) is
//! `min(initial_delay_s * backoff_multiplier^(n-1), max_delay_s)`.
//!
//! Transient errors always retry while attempts remain; permanent errors and
//! cancellations never do; timeouts retry unless the policy opts out.

use crate::model::NodeErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Retry plan for one node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in seconds.
    #[serde(default = "default_initial_delay_s")]
    pub initial_delay_s: f64,
    /// Multiplier applied per attempt. At least 1.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in seconds.
    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f64,
    /// Whether timeouts count as retryable.
    #[serde(default = "default_retry_on_timeout")]
    pub retry_on_timeout: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_s() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_s() -> f64 {
    30.0
}

fn default_retry_on_timeout() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_s: default_initial_delay_s(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_s: default_max_delay_s(),
            retry_on_timeout: default_retry_on_timeout(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// The built-in default for a node type.
    ///
    /// Trigger-style types consume external events and must not be replayed
    /// by the engine, so they get a single attempt. HTTP and LLM calls see
    /// enough transient failures to warrant patient backoff.
    #[must_use]
    pub fn for_node_type(node_type: &str) -> Self {
        if node_type.contains("trigger") || node_type.contains("webhook") {
            return Self::single_attempt();
        }
        match node_type {
            "http" => Self {
                max_attempts: 3,
                initial_delay_s: 1.0,
                backoff_multiplier: 2.0,
                max_delay_s: 30.0,
                retry_on_timeout: true,
            },
            "llm" | "ai" => Self {
                max_attempts: 2,
                initial_delay_s: 2.0,
                backoff_multiplier: 2.0,
                max_delay_s: 60.0,
                retry_on_timeout: true,
            },
            _ => Self::default(),
        }
    }

    /// Returns whether an error of this kind should be retried, attempts
    /// permitting.
    #[must_use]
    pub fn is_retryable(&self, kind: NodeErrorKind) -> bool {
        match kind {
            NodeErrorKind::Transient => true,
            NodeErrorKind::Timeout => self.retry_on_timeout,
            NodeErrorKind::Permanent | NodeErrorKind::Cancelled => false,
        }
    }

    /// Delay before the given attempt (1-indexed; the first retry is
    /// attempt 2).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = self.initial_delay_s * self.backoff_multiplier.powi(exponent as i32);
        Duration::from_secs_f64(raw.min(self.max_delay_s).max(0.0))
    }
}

/// Resolves the effective policy for a node type from, in order: the
/// execution's overrides, the engine's configured overrides, the built-in
/// defaults.
#[must_use]
pub fn resolve_policy(
    node_type: &str,
    execution_overrides: &HashMap<String, RetryPolicy>,
    engine_overrides: &HashMap<String, RetryPolicy>,
) -> RetryPolicy {
    execution_overrides
        .get(node_type)
        .or_else(|| engine_overrides.get(node_type))
        .cloned()
        .unwrap_or_else(|| RetryPolicy::for_node_type(node_type))
}
