pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::adapters::Registry;
use crate::events::EventBus;
use crate::services::account_pool::AccountPool;
use crate::services::billing::BillingFinalizer;
use crate::services::cache::CacheService;
use crate::services::creation::CreationService;
use crate::services::retry::RetryController;

/// Shared application state injected into every handler, mirroring the
/// reference service's `AppState` pattern in `server/services/mod.rs`.
pub struct AppState {
    pub pool: PgPool,
    pub creation: CreationService,
    pub cache: CacheService,
    pub retry: RetryController,
    pub registry: Registry,
    pub account_pool: AccountPool,
    pub billing: BillingFinalizer,
    pub events: EventBus,
}

pub type SharedState = Arc<AppState>;

/// Build the axum router for the external API surface.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/generations", post(handlers::generations::create))
        .route("/api/v1/generations", get(handlers::generations::list))
        .route("/api/v1/generations/:id", get(handlers::generations::get))
        .route("/api/v1/generations/:id", delete(handlers::generations::delete))
        .route("/api/v1/generations/:id/cancel", post(handlers::generations::cancel))
        .route("/api/v1/generations/:id/retry", post(handlers::generations::retry))
        .route("/healthz", get(handlers::health::healthz))
        .route("/metrics", get(handlers::health::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
