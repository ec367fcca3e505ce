use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use chrono::Utc;

use crate::domain::generation::{Generation, GenerationStatus};
use crate::domain::params::OperationType;
use crate::domain::rating::ContentRating;
use crate::error::AppError;
use crate::events::{JobEvent, Topic};
use crate::http::SharedState;
use crate::services::cache::CacheStrategy;
use crate::services::creation::CreateOptions;

/// Minimal stand-in for the authentication middleware the reference
/// service's `server::middleware` layer would normally provide; the
/// principal is carried as `X-User-Id` since full auth is out of scope here.
fn require_user_id(headers: &HeaderMap) -> Result<i64, AppError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| AppError::InvalidOperation("missing or invalid X-User-Id header".into()))
}

#[derive(Debug, Deserialize)]
pub struct CreateGenerationRequest {
    pub operation: OperationType,
    pub provider_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub force_new: bool,
    #[serde(default)]
    pub cache_strategy: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub playthrough_id: Option<String>,
    #[serde(default)]
    pub prompt_version_id: Option<i64>,
    #[serde(default)]
    pub world_max_rating: Option<String>,
    #[serde(default)]
    pub user_max_rating: Option<String>,
}

fn parse_strategy(raw: Option<&str>) -> CacheStrategy {
    match raw {
        Some("per_playthrough") => CacheStrategy::PerPlaythrough,
        Some("per_player") => CacheStrategy::PerPlayer,
        Some("always") => CacheStrategy::Always,
        _ => CacheStrategy::Once,
    }
}

fn parse_rating(raw: Option<&str>, default: ContentRating) -> ContentRating {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub async fn create(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateGenerationRequest>,
) -> Result<Json<Generation>, AppError> {
    let user_id = require_user_id(&headers)?;

    let options = CreateOptions {
        force_new: body.force_new,
        cache_strategy: parse_strategy(body.cache_strategy.as_deref()),
        purpose: body.purpose.unwrap_or_else(|| "default".to_string()),
        playthrough_id: body.playthrough_id,
        prompt_version_id: body.prompt_version_id,
        cache_version: 1,
        world_max_rating: parse_rating(body.world_max_rating.as_deref(), ContentRating::Restricted),
        user_max_rating: parse_rating(body.user_max_rating.as_deref(), ContentRating::Restricted),
    };

    let generation = state
        .creation
        .create_generation(user_id, body.operation, &body.provider_id, body.params, options)
        .await?;

    Ok(Json(generation))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<GenerationStatus>,
    pub operation_type: Option<OperationType>,
    pub workspace_id: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Generation>>, AppError> {
    let user_id = require_user_id(&headers)?;
    let limit = query.limit.clamp(1, 200);

    let rows = sqlx::query_as::<_, Generation>(
        r#"
        SELECT * FROM generations
        WHERE user_id = $1
          AND ($2::text IS NULL OR status = $2)
          AND ($3::text IS NULL OR operation = $3)
        ORDER BY created_at DESC
        LIMIT $4 OFFSET $5
        "#,
    )
    .bind(user_id)
    .bind(query.status.map(|s| s.as_str().to_string()))
    .bind(query.operation_type.map(|o| o.as_str().to_string()))
    .bind(limit)
    .bind(query.offset)
    .fetch_all(&state.pool)
    .await?;

    let _ = query.workspace_id; // not modeled on `generations` in this schema; accepted for API compatibility.
    Ok(Json(rows))
}

pub async fn get(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Generation>, AppError> {
    let generation = sqlx::query_as::<_, Generation>("SELECT * FROM generations WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("generation {id}")))?;
    Ok(Json(generation))
}

/// Synchronous, best-effort adapter cancel: always ends in local CANCELLED
/// regardless of the provider's response.
pub async fn cancel(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Generation>, AppError> {
    let generation = sqlx::query_as::<_, Generation>("SELECT * FROM generations WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("generation {id}")))?;

    if generation.status.is_terminal() {
        return Ok(Json(generation));
    }

    if generation.status == GenerationStatus::Processing {
        if let Some(account_id) = generation.account_id {
            if let Some(adapter) = state.registry.get(&generation.provider_id) {
                if let Some(submission) = sqlx::query_as::<_, crate::domain::submission::ProviderSubmission>(
                    "SELECT * FROM provider_submissions WHERE generation_id = $1 ORDER BY submitted_at DESC LIMIT 1",
                )
                .bind(id)
                .fetch_optional(&state.pool)
                .await?
                {
                    if let Some(account) = sqlx::query_as::<_, crate::domain::account::ProviderAccount>(
                        "SELECT * FROM provider_accounts WHERE id = $1",
                    )
                    .bind(account_id)
                    .fetch_optional(&state.pool)
                    .await?
                    {
                        let _ = adapter.cancel(&account, &submission.provider_job_id).await;
                    }
                }
            }
            let _ = state.account_pool.release_account(account_id).await;
        }
    }

    let updated = sqlx::query_as::<_, Generation>(
        r#"
        UPDATE generations
        SET status = 'CANCELLED', completed_at = now(), updated_at = now()
        WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
        RETURNING *
        "#,
    )
    .bind(id)
    .fetch_optional(&state.pool)
    .await?;

    let Some(updated) = updated else {
        // Lost the race to a poller/submission transition that landed first;
        // report whatever the row now holds instead of clobbering it.
        let current = sqlx::query_as::<_, Generation>("SELECT * FROM generations WHERE id = $1")
            .bind(id)
            .fetch_optional(&state.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("generation {id}")))?;
        return Ok(Json(current));
    };

    state.billing.finalize_billing(&updated, None, None).await;

    let _ = state
        .events
        .publish(
            Topic::JobCancelled,
            JobEvent {
                generation_id: updated.id,
                user_id: updated.user_id,
                status: GenerationStatus::Cancelled.to_string(),
                error: None,
                occurred_at: Utc::now(),
            },
        )
        .await;

    Ok(Json(updated))
}

pub async fn retry(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Generation>, AppError> {
    let created = state
        .retry
        .create_retry(id)
        .await
        .map_err(|e| AppError::InvalidOperation(e.to_string()))?;
    Ok(Json(created))
}

pub async fn delete(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let generation = sqlx::query_as::<_, Generation>("SELECT * FROM generations WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("generation {id}")))?;

    if !generation.status.is_terminal() {
        return Err(AppError::InvalidOperation(
            "generation must be in a terminal state to be deleted".into(),
        ));
    }

    sqlx::query("DELETE FROM generations WHERE id = $1").bind(id).execute(&state.pool).await?;
    Ok(StatusCode::NO_CONTENT)
}
