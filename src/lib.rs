//! buildwatch -- Statistical anomaly detection and alerting for building IoT sensors.
//!
//! This crate provides the detection core (z-score baselines over a trailing
//! window, status-sensor error checks), cooldown-deduplicated alert emission,
//! a SQLite-backed store, and an HTTP API for triggering runs and handling alerts.

pub mod api;
pub mod config;
pub mod detect;
pub mod sensors;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use crate::config::BuildwatchConfig;

/// Start the buildwatch API server.
pub async fn serve(config: &BuildwatchConfig) -> Result<()> {
    // 1. Initialize Storage
    let db_path = &config.storage.db_path;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let store = Arc::new(storage::SqliteStore::open(db_path)?);

    // 2. Build shared state
    let state = api::state::AppState::new(store, config.detector.clone());

    // 3. Start API Server
    let addr: std::net::SocketAddr = config.server.bind.parse()?;
    let app = api::router(state);

    tracing::info!(%addr, "buildwatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
