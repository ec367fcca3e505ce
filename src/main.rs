use std::sync::Arc;
use std::time::Duration;

use genforge::adapters::Registry;
use genforge::configuration::get_configuration;
use genforge::database::{get_connection_pool, migrate_database};
use genforge::events::EventBus;
use genforge::http::{router, AppState};
use genforge::queue::Queue;
use genforge::services::account_pool::AccountPool;
use genforge::services::billing::BillingFinalizer;
use genforge::services::cache::CacheService;
use genforge::services::creation::CreationService;
use genforge::services::ingestor::AssetIngestor;
use genforge::services::poller::StatusPoller;
use genforge::services::retry::RetryController;
use genforge::services::submission::SubmissionPipeline;
use genforge::telemetry::init_tracing;
use genforge::workers::WorkerFleet;
use secrecy::ExposeSecret;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenvy::dotenv().ok();

    let configuration = get_configuration().expect("failed to read configuration");

    let pool = get_connection_pool(&configuration).await?;
    migrate_database(&pool).await?;

    let redis_client = redis::Client::open(configuration.redis.url.expose_secret().as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;

    let registry = Registry::bootstrap(Duration::from_secs(configuration.worker.provider_timeout_secs));
    let cache = CacheService::new(redis_conn.clone());
    let queue = Queue::new(redis_conn.clone());
    let events = EventBus::new(redis_conn.clone());
    let account_pool = AccountPool::new(pool.clone());
    let billing = BillingFinalizer::new(pool.clone(), registry.clone(), account_pool.clone());
    let retry = RetryController::new(
        pool.clone(),
        queue.clone(),
        configuration.worker.max_retries,
        configuration.worker.auto_retry_enabled,
    );
    let ingestor = AssetIngestor::new(
        pool.clone(),
        registry.clone(),
        configuration.storage.clone(),
        Duration::from_secs(configuration.worker.download_timeout_secs),
    );
    let submission = SubmissionPipeline::new(
        pool.clone(),
        registry.clone(),
        account_pool.clone(),
        billing.clone(),
        retry.clone(),
        events.clone(),
    );
    let poller = StatusPoller::new(
        pool.clone(),
        registry.clone(),
        account_pool.clone(),
        billing.clone(),
        retry.clone(),
        ingestor.clone(),
        events.clone(),
        configuration.worker.generation_timeout_secs,
        configuration.worker.analysis_timeout_secs,
    );
    let creation = CreationService::new(
        pool.clone(),
        registry.clone(),
        cache.clone(),
        queue.clone(),
        events.clone(),
        configuration.worker.max_concurrent_jobs_per_user,
    );

    let fleet = WorkerFleet::spawn(
        pool.clone(),
        queue.clone(),
        submission,
        poller,
        account_pool.clone(),
        configuration.worker.clone(),
    )
    .await;

    let state = Arc::new(AppState {
        pool,
        creation,
        cache,
        retry,
        registry,
        account_pool,
        billing,
        events,
    });

    let app = router(state);

    let port = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8080);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("genforge listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    fleet.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    info!("shutdown signal received");
}
