// Pitchside v0.1.0 - Match Analysis Orchestrator

mod api;
mod auth;
mod config;
mod db;
mod dispatcher;
mod hub;
mod infrastructure;
mod lifecycle;
mod live;
mod metrics;
mod models;
mod policy;
mod queue;
mod repository;
mod storage;
mod vision;
mod webhook;
mod workers;

#[cfg(test)]
mod testing;

use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::dispatcher::JobDispatcher;
use crate::hub::BroadcastHub;
use crate::policy::RateLimiter;
use crate::queue::JobQueue;
use crate::repository::JobRepository;
use crate::webhook::WebhookIngestor;
use crate::workers::dispatch::{self as dispatch_workers, DispatchWorker};

const PROMOTER_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(":: Pitchside v0.1.0 ::");

    let settings = Settings::from_env().map_err(|e| {
        error!("❌ {}", e);
        e
    })?;
    settings.log_summary();

    // 1. Infrastructure
    let infra = infrastructure::setup(&settings).await?;
    let repo = JobRepository::new(infra.db_pool.clone());
    let queue: Arc<dyn JobQueue> = infra.queue.clone();
    match dispatch_workers::sync_queued_gauge(queue.as_ref()).await {
        Ok(backlog) => info!("📦 {} dispatch tasks waiting.", backlog),
        Err(e) => error!("Failed to read dispatch backlog: {}", e),
    }
    let vision = Arc::new(infra.vision);
    let hub = Arc::new(BroadcastHub::new());

    // 2. Dispatcher, shared by the request path and the worker pool
    let dispatcher = Arc::new(JobDispatcher::new(
        repo.clone(),
        Arc::new(infra.storage),
        vision.clone(),
        settings.webhook_url(),
        settings.media_url_ttl,
        settings.default_sport.clone(),
    ));

    // 3. Background workers, sharing the submission budget with the request path
    let limiter = Arc::new(RateLimiter::from_policy(&settings.policy));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let worker = Arc::new(DispatchWorker::new(
        queue.clone(),
        repo.clone(),
        dispatcher.clone(),
        limiter.clone(),
        settings.policy.clone(),
    ));
    let mut background = dispatch_workers::spawn(worker, &shutdown_tx);
    background.push(dispatch_workers::spawn_promoter(
        queue.clone(),
        PROMOTER_INTERVAL,
        shutdown_tx.subscribe(),
    ));

    // 4. App State
    let port = settings.port;
    let state = Arc::new(api::AppState {
        repo: repo.clone(),
        queue,
        dispatcher,
        limiter,
        vision,
        ingestor: WebhookIngestor::new(repo, hub.clone()),
        hub,
        settings,
    });

    // 5. Start Server
    let app = api::create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("🛑 Shutdown signal received.");
            let _ = server_shutdown.send(());
        })
        .await?;

    for handle in background {
        if let Err(e) = handle.await {
            error!("Background task ended abnormally: {}", e);
        }
    }
    info!("Bye.");
    Ok(())
}
