mod common;

use common::{setup_test_db, setup_test_redis};
use genforge::adapters::Registry;
use genforge::domain::generation::GenerationStatus;
use genforge::domain::params::{CreateRequestParams, GenerationConfig, OperationType};
use genforge::events::EventBus;
use genforge::queue::Queue;
use genforge::services::cache::CacheService;
use genforge::services::creation::{CreateOptions, CreationService};
use std::time::Duration;

fn text_to_video_request(prompt: &str) -> CreateRequestParams {
    CreateRequestParams {
        generation_config: GenerationConfig {
            prompt: Some(prompt.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn build_service(pool: sqlx::PgPool) -> CreationService {
    let redis = setup_test_redis().await;
    let registry = Registry::bootstrap(Duration::from_secs(10));
    let cache = CacheService::new(redis.clone());
    let queue = Queue::new(redis.clone());
    let events = EventBus::new(redis);
    CreationService::new(pool, registry, cache, queue, events, 20)
}

#[tokio::test]
async fn identical_requests_dedup_to_the_same_generation() {
    let pool = setup_test_db().await;
    let service = build_service(pool.clone()).await;

    let params = text_to_video_request("a sunlit meadow");
    let first = service
        .create_generation(
            1,
            OperationType::TextToVideo,
            "pixverse",
            params.clone(),
            CreateOptions::default(),
        )
        .await
        .expect("first create_generation should succeed");

    let second = service
        .create_generation(1, OperationType::TextToVideo, "pixverse", params, CreateOptions::default())
        .await
        .expect("second create_generation should reuse the first");

    assert_eq!(first.id, second.id);
    assert_eq!(second.status, GenerationStatus::Pending);
}

#[tokio::test]
async fn force_new_bypasses_dedup() {
    let pool = setup_test_db().await;
    let service = build_service(pool.clone()).await;

    let params = text_to_video_request("a quiet harbor at dawn");
    let first = service
        .create_generation(2, OperationType::TextToVideo, "pixverse", params.clone(), CreateOptions::default())
        .await
        .expect("first create should succeed");

    let options = CreateOptions { force_new: true, ..CreateOptions::default() };
    let second = service
        .create_generation(2, OperationType::TextToVideo, "pixverse", params, options)
        .await
        .expect("forced create should succeed");

    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn quota_is_enforced_per_user() {
    let pool = setup_test_db().await;
    let service = CreationService::new(
        pool.clone(),
        Registry::bootstrap(Duration::from_secs(10)),
        CacheService::new(setup_test_redis().await),
        Queue::new(setup_test_redis().await),
        EventBus::new(setup_test_redis().await),
        1,
    );

    let first_params = text_to_video_request("prompt one");
    service
        .create_generation(3, OperationType::TextToVideo, "pixverse", first_params, CreateOptions::default())
        .await
        .expect("first generation under quota should succeed");

    let second_params = text_to_video_request("prompt two, different hash");
    let result = service
        .create_generation(3, OperationType::TextToVideo, "pixverse", second_params, CreateOptions::default())
        .await;

    assert!(matches!(result, Err(genforge::services::creation::CreationError::Quota(_))));
}

#[tokio::test]
async fn unsupported_provider_operation_is_rejected() {
    let pool = setup_test_db().await;
    let service = build_service(pool).await;

    let params = text_to_video_request("an underwater city");
    let result = service
        .create_generation(4, OperationType::Fusion, "pixverse", params, CreateOptions::default())
        .await;

    assert!(matches!(
        result,
        Err(genforge::services::creation::CreationError::InvalidOperation(_))
    ));
}
