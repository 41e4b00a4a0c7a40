//! Task marketplace core: entry point.
//!
//! Serves the REST API for tasks, payment orders and agent webhooks, and
//! runs the outbox worker that delivers task events to agent endpoints.

mod api;
mod auth;
mod config;
mod db;
mod errors;
mod events;
mod idempotency;
mod payments;
mod quota;
mod signing;
mod tasks;
mod webhooks;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use payments::provider::HttpSettlementProvider;
use webhooks::outbox::{self, OutboxState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let provider_client = Client::builder()
        .timeout(Duration::from_secs(config.provider.timeout_secs))
        .build()?;
    let provider = HttpSettlementProvider::new(provider_client, config.provider.clone());

    let shutdown = CancellationToken::new();

    // ─── Outbox worker ────────────────────────────────────
    let webhook_client = Client::builder()
        .timeout(Duration::from_secs(config.outbox.webhook_timeout_secs))
        .build()?;
    let outbox_state = Arc::new(OutboxState {
        pool: pool.clone(),
        config: config.outbox.clone(),
        client: webhook_client,
    });
    let worker = tokio::spawn(outbox::run(outbox_state, shutdown.clone()));

    // ─── REST API ─────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.api_port);
    let api_state = Arc::new(api::ApiState {
        pool,
        config,
        provider: Arc::new(provider),
    });
    let app = api::router(api_state);

    info!("API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    worker.await?;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }
}
