//! Engine host daemon.
//!
//! Wires a store, a handler registry, and the engine together, runs startup
//! recovery, and keeps the recovery sweeper alive until shutdown. The
//! surrounding application embeds the engine crate directly; this binary is
//! the standalone deployment shape.

mod config;

use crate::config::DaemonConfig;
use conflux_engine::{EchoHandler, Engine, HandlerRegistry, NullEmitter};
use conflux_store::{MemoryStore, RedisStore, Store};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::from_env()
        .inspect_err(|e| tracing::error!(error = %e, "failed to load configuration"))?;

    let store: Arc<dyn Store> = match &config.redis_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                tracing::info!(url = %url, "connected to redis");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!(
                    url = %url,
                    error = %e,
                    "redis unavailable, using embedded store in single-node mode"
                );
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            tracing::info!("no redis_url configured, using embedded store in single-node mode");
            Arc::new(MemoryStore::new())
        }
    };

    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(EchoHandler));

    let engine = Engine::new(store, registry, Arc::new(NullEmitter), config.engine);

    // Startup recovery: reclaim executions whose runners died with us.
    let redriven = engine.recover().await;
    if redriven > 0 {
        tracing::info!(redriven, "startup recovery re-drove executions");
    }

    let sweeper = engine.spawn_sweeper();
    tracing::info!("engine ready");

    tokio::signal::ctrl_c()
        .await
        .inspect_err(|e| tracing::error!(error = %e, "failed to listen for shutdown signal"))?;
    tracing::info!("shutting down");
    sweeper.abort();
    Ok(())
}
