mod common;

use axum_test::TestServer;
use common::{setup_test_db, setup_test_redis};
use genforge::adapters::Registry;
use genforge::events::EventBus;
use genforge::http::{router, AppState};
use genforge::queue::Queue;
use genforge::services::account_pool::AccountPool;
use genforge::services::billing::BillingFinalizer;
use genforge::services::cache::CacheService;
use genforge::services::creation::CreationService;
use genforge::services::retry::RetryController;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn healthz_reports_database_connectivity() {
    let pool = setup_test_db().await;
    let redis = setup_test_redis().await;
    let registry = Registry::bootstrap(Duration::from_secs(10));
    let account_pool = AccountPool::new(pool.clone());

    let state = Arc::new(AppState {
        pool: pool.clone(),
        creation: CreationService::new(
            pool.clone(),
            registry.clone(),
            CacheService::new(redis.clone()),
            Queue::new(redis.clone()),
            EventBus::new(redis.clone()),
            20,
        ),
        cache: CacheService::new(redis.clone()),
        retry: RetryController::new(pool.clone(), Queue::new(redis.clone()), 10, true),
        registry: registry.clone(),
        account_pool: account_pool.clone(),
        billing: BillingFinalizer::new(pool, registry, account_pool),
        events: EventBus::new(redis),
    });

    let server = TestServer::new(router(state)).expect("failed to build test server");
    let response = server.get("/healthz").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], true);
}
