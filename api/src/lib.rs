//! HTTP surface and process lifecycle for LiveReview.
//!
//! `start()` owns the process-wide resources: the store (single relational
//! DB behind `DATABASE_URL`), the resilient LLM client, the worker pool,
//! and the axum server. Shutdown is graceful: stop accepting HTTP, flip
//! the worker shutdown flag, join the pool, then drop the store.
//!
//! Environment:
//! - `DATABASE_URL`                  — required, e.g. "sqlite://livereview.db"
//! - `BIND_ADDR`                     — default "0.0.0.0:8080"
//! - `LIVEREVIEW_WORKERS`            — worker pool size (default 2)
//! - `LIVEREVIEW_QUEUE_WATERMARK`    — 503 threshold for manual triggers
//! - `LIVEREVIEW_REPLY_BUDGET_SECS`  — webhook reply budget (default 10)
//! - `LLM_*`                         — see llm-service config

pub mod core;
pub mod error_handler;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use llm_service::config::default_config::{model_config_from_env, retry_policy_from_env};
use llm_service::ResilientLlmClient;
use review_pipeline::worker::{WorkerConfig, spawn_workers};
use review_store::Store;

use crate::core::app_state::AppState;
use crate::error_handler::{AppError, AppResult};
use crate::routes::health_route::health;
use crate::routes::reviews::manual_review_route::trigger_manual_review;
use crate::routes::webhooks::webhook_route::handle_webhook;

fn must_env(name: &'static str) -> AppResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(AppError::MissingEnv(name))
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Builds the router. Split out so tests can drive handlers without a
/// listener.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/webhooks/{provider}/{connector_id}",
            post(handle_webhook),
        )
        .route("/api/v1/reviews/manual", post(trigger_manual_review))
        .with_state(state)
}

/// Starts the service and blocks until shutdown.
pub async fn start() -> AppResult<()> {
    let database_url = must_env("DATABASE_URL")?;
    let bind_addr = env_or("BIND_ADDR", "0.0.0.0:8080".to_string());

    let worker_cfg = WorkerConfig::from_env();
    // Pool must exceed worker count so lease queries never starve.
    let store = Store::connect(&database_url, (worker_cfg.pool_size as u32) + 4)
        .await
        .map_err(|e| AppError::Storage(e.to_string()))?;

    let llm_cfg = model_config_from_env()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let retry = retry_policy_from_env().map_err(|e| AppError::BadRequest(e.to_string()))?;
    let llm = Arc::new(
        ResilientLlmClient::new(llm_cfg, retry)
            .map_err(|e| AppError::BadRequest(e.to_string()))?,
    );

    let notify = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = spawn_workers(
        store.clone(),
        Arc::clone(&llm),
        Arc::clone(&notify),
        shutdown_rx,
        worker_cfg.clone(),
    );
    info!(workers = worker_cfg.pool_size, "worker pool up");

    let state = Arc::new(AppState {
        store,
        llm,
        notify,
        queue_watermark: env_or("LIVEREVIEW_QUEUE_WATERMARK", 100i64),
        reply_budget: Duration::from_secs(env_or("LIVEREVIEW_REPLY_BUDGET_SECS", 10u64)),
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(AppError::Bind)?;
    info!(%bind_addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| AppError::Server(std::io::Error::other(e)))?;

    // Drain the pool before dropping the store.
    let _ = shutdown_tx.send(true);
    for handle in workers {
        if tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .is_err()
        {
            warn!("worker did not stop within 30s, abandoning");
        }
    }
    info!("workers drained, bye");

    Ok(())
}
