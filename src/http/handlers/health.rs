use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::http::SharedState;

/// Liveness probe, mirroring the reference service's `routes::health_check`.
pub async fn healthz(State(state): State<SharedState>) -> Json<Value> {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.pool).await.is_ok();
    Json(json!({ "status": if db_ok { "ok" } else { "degraded" }, "database": db_ok }))
}

/// Cache hit/miss/total-cached counters, shaped as a lightweight metrics
/// dump rather than a full Prometheus exporter.
pub async fn metrics(State(state): State<SharedState>) -> Json<Value> {
    match state.cache.get_stats().await {
        Ok(stats) => Json(json!({ "cache": stats })),
        Err(e) => Json(json!({ "cache": null, "error": e.to_string() })),
    }
}
