//! runwarden -- test scheduling, execution orchestration and selector healing.
//!
//! This crate provides the core library for timezone-aware schedules, the
//! run ledger, the worker pool that executes tests, and the healing analyzer
//! that proposes replacement selectors for failed interactions.

pub mod api;
pub mod clock;
pub mod config;
pub mod healing;
pub mod scheduler;
pub mod storage;
pub mod watch;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::state::AppState;
use crate::config::AppConfig;
use crate::worker::CommandExecutor;

/// How long shutdown waits for in-flight runs before leaving them to
/// lease recovery.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Start the runwarden daemon: API server, worker loop and healing worker.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Storage
    info!(db_path = %config.server.db_path, "initializing database");
    let pool = storage::open_pool(&config.server.db_path)
        .with_context(|| format!("failed to open database {}", config.server.db_path))?;

    // 2. Components
    let healing = AppState::healing_service(&config, pool.clone());
    let (queue, healing_worker) = healing.start_worker();
    let executor = Arc::new(CommandExecutor::new(config.executor.clone()));
    let state = AppState::new(&config, pool, executor, healing, Some(queue));

    state
        .dispatcher
        .recover(Utc::now())
        .context("failed to recover interrupted runs")?;

    if let Err(e) = state.watcher.start() {
        warn!(error = %e, "test watcher not started");
    }

    // 3. Worker loop
    let shutdown = CancellationToken::new();
    let worker = if config.worker.enabled {
        let dispatcher = state.dispatcher.clone();
        let token = shutdown.child_token();
        Some(tokio::spawn(async move { dispatcher.run_loop(token).await }))
    } else {
        info!("worker disabled; schedules will only run on demand");
        None
    };

    // 4. API server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "runwarden listening");
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.cancel();
        })
        .await?;

    // 5. Drain
    shutdown.cancel();
    if let Some(worker) = worker {
        if let Err(e) = worker.await {
            warn!(error = %e, "worker loop ended abnormally");
        }
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, state.dispatcher.wait_idle())
        .await
        .is_err()
    {
        warn!("in-flight runs still active at shutdown; they will be recovered once their lease lapses");
    }
    drop(state);
    if tokio::time::timeout(DRAIN_TIMEOUT, healing_worker).await.is_err() {
        warn!("healing queue not drained at shutdown");
    }

    info!("runwarden stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
