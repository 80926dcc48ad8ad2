//! syncwire - Real-time CRUD engine
//!
//! Serves an in-memory store over the embedded (or an external) broker.

use std::sync::Arc;
use syncwire_core::{Catalog, MemoryStore};
use syncwire_server::{Config, Engine};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if SYNCWIRE_CONFIG is set, then env overrides)
    let config_path = std::env::var("SYNCWIRE_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting syncwire engine");
    tracing::info!("  Broker mode: {:?}", config.broker.mode);
    tracing::info!("  Topic prefix: {}", config.engine.topic_prefix);
    if config.auth.required {
        tracing::info!(
            "  Authentication: enabled ({} token(s))",
            config.auth.token_hashes.len()
        );
    } else {
        tracing::info!("  Authentication: disabled");
    }
    if config.metrics.enabled {
        tracing::info!("  Metrics: http://{}/metrics", config.metrics.bind_addr);
    }

    let engine = Engine::new(&config, Arc::new(MemoryStore::new()), Catalog::permissive())?;
    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping engine...");
    engine.shutdown().await;

    tracing::info!("Engine stopped");
    Ok(())
}
