//! Daemon configuration.
//!
//! Loaded from environment variables via the `config` crate, with `__` as
//! the nesting separator: `ENGINE__SWEEPER_INTERVAL_S=30`, `REDIS_URL=...`.

use conflux_engine::EngineConfig;
use serde::Deserialize;

/// Top-level daemon configuration.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Redis connection URL. When absent or unreachable the daemon runs on
    /// the embedded in-memory store in single-node mode.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Engine tuning knobs.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl DaemonConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if present configuration is malformed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_apply_without_environment() {
        let config: DaemonConfig = serde_json::from_str("{}").expect("deserialize");
        assert!(config.redis_url.is_none());
        assert_eq!(config.engine.sweeper_interval_s, 60);
    }
}
