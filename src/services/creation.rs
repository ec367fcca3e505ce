use std::str::FromStr;

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::adapters::Registry;
use crate::domain::generation::{Generation, GenerationStatus};
use crate::domain::params::{
    is_structured_params, json_canonical, reproducible_hash, CanonicalParams, CreateRequestParams,
    Inputs, OperationType,
};
use crate::domain::prompt::{normalize_prompt_text, prompt_text_hash, PromptVersion};
use crate::domain::rating::ContentRating;
use crate::events::{EventBus, JobEvent, Topic};
use crate::queue::{Queue, Task};
use crate::services::cache::{compute_cache_key, CacheKeyParts, CacheService, CacheStrategy};

/// Errors surfaced to the HTTP caller of `create_generation`. Folded into
/// [`crate::error::AppError`] at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("params must be a structured object containing at least one of generation_config, scene_context, player_context, social_context; legacy flat payloads are not accepted")]
    UnstructuredParams,
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("unrecognized content rating: {0}")]
    UnknownRating(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Caller-supplied knobs that sit alongside `params` but aren't part of the
/// provider-agnostic request body.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub force_new: bool,
    pub cache_strategy: CacheStrategy,
    pub purpose: String,
    pub playthrough_id: Option<String>,
    pub prompt_version_id: Option<i64>,
    pub cache_version: u32,
    pub world_max_rating: ContentRating,
    pub user_max_rating: ContentRating,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            force_new: false,
            cache_strategy: CacheStrategy::Once,
            purpose: "default".to_string(),
            playthrough_id: None,
            prompt_version_id: None,
            cache_version: 1,
            world_max_rating: ContentRating::Restricted,
            user_max_rating: ContentRating::Restricted,
        }
    }
}

/// Creation Service: the single synchronous entry point a request-handling
/// task calls to create (or reuse) a Generation.
#[derive(Clone)]
pub struct CreationService {
    pool: PgPool,
    registry: Registry,
    cache: CacheService,
    queue: Queue,
    events: EventBus,
    max_concurrent_jobs_per_user: i64,
}

impl CreationService {
    pub fn new(
        pool: PgPool,
        registry: Registry,
        cache: CacheService,
        queue: Queue,
        events: EventBus,
        max_concurrent_jobs_per_user: i64,
    ) -> Self {
        Self {
            pool,
            registry,
            cache,
            queue,
            events,
            max_concurrent_jobs_per_user,
        }
    }

    pub async fn create_generation(
        &self,
        user_id: i64,
        operation: OperationType,
        provider_id: &str,
        raw_params: Value,
        options: CreateOptions,
    ) -> Result<Generation, CreationError> {
        // Step 1: quota check.
        let in_flight: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM generations WHERE user_id = $1 AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        if in_flight >= self.max_concurrent_jobs_per_user {
            return Err(CreationError::Quota(format!(
                "user {user_id} has {in_flight} concurrent jobs (limit {})",
                self.max_concurrent_jobs_per_user
            )));
        }

        // Step 2: provider support.
        let adapter = self
            .registry
            .get(provider_id)
            .ok_or_else(|| CreationError::InvalidOperation(format!("unknown provider {provider_id}")))?;
        if !adapter.supported_operations().contains(&operation) {
            return Err(CreationError::InvalidOperation(format!(
                "provider {provider_id} does not support {operation:?}"
            )));
        }

        // Step 3: structured-params validation. Legacy flat payloads (a bare
        // `prompt`/`image_url` at the top level of `params`, or no `params`
        // at all) are rejected outright rather than silently deserialized
        // into an all-empty envelope.
        if !is_structured_params(&raw_params) {
            return Err(CreationError::UnstructuredParams);
        }
        let mut params: CreateRequestParams = serde_json::from_value(raw_params)
            .map_err(|e| CreationError::InvalidOperation(format!("malformed params: {e}")))?;
        validate_operation_fields(operation, &params)?;

        // Step 4: content-rating enforcement.
        let requested = match &params.social_context.content_rating {
            Some(raw) => {
                ContentRating::from_str(raw).map_err(|e| CreationError::UnknownRating(e.0))?
            }
            None => ContentRating::Sfw,
        };
        let effective_max = options.world_max_rating.min(options.user_max_rating);
        if requested > effective_max {
            warn!(
                user_id,
                requested = %requested,
                effective_max = %effective_max,
                "content rating clamped"
            );
            params.social_context.original_rating = Some(requested.to_string());
            params.social_context.rating_clamped = true;
            params.social_context.content_rating = Some(effective_max.to_string());
        }

        // Step 5: canonicalization.
        let canonical_params = canonicalize(operation, provider_id, &params);

        // Step 6: input extraction.
        let inputs = extract_inputs(&params);

        // Step 7: reproducible hash.
        let hash = reproducible_hash(&canonical_params, &inputs);

        // Step 8: dedup lookup.
        if !options.force_new {
            if let Some(existing_id) = self.cache.get_dedup(&hash).await.unwrap_or(None) {
                if let Some(generation) = self.load_if_reusable(existing_id, &hash, None).await? {
                    return Ok(generation);
                }
            }
        }

        // Step 9: cache lookup.
        let cache_key_parts = CacheKeyParts {
            operation: operation.as_str(),
            purpose: &options.purpose,
            from_scene_id: params.scene_context.from_scene.as_ref().and_then(|s| s.id.as_deref()),
            to_scene_id: params.scene_context.to_scene.as_ref().and_then(|s| s.id.as_deref()),
            strategy: options.cache_strategy,
            playthrough_id: options.playthrough_id.as_deref(),
            user_id,
            version: options.cache_version,
        };
        let cache_key = compute_cache_key(&cache_key_parts);
        if !options.force_new {
            if let Some(key) = &cache_key {
                if let Some(existing_id) = self.cache.get_cache(key).await.unwrap_or(None) {
                    if let Some(generation) = self.load_if_reusable(existing_id, &hash, Some(key)).await? {
                        return Ok(generation);
                    }
                }
            }
        }

        // Step 10: prompt resolution.
        let prompt_version_id = self.resolve_prompt_version(&params, options.prompt_version_id).await?;

        // Step 11: persist as PENDING.
        let raw_params = serde_json::to_value(&params).map_err(|e| CreationError::Internal(e.into()))?;
        let canonical_value =
            serde_json::to_value(&canonical_params).map_err(|e| CreationError::Internal(e.into()))?;
        let inputs_value = serde_json::to_value(&inputs).map_err(|e| CreationError::Internal(e.into()))?;

        let generation = sqlx::query_as::<_, Generation>(
            r#"
            INSERT INTO generations (
                user_id, operation, provider_id, raw_params, canonical_params, inputs,
                reproducible_hash, status, billing_state, retry_count, prompt_version_id,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING', 'UNCHARGED', 0, $8, now(), now())
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(operation)
        .bind(provider_id)
        .bind(&raw_params)
        .bind(&canonical_value)
        .bind(&inputs_value)
        .bind(&hash)
        .bind(prompt_version_id)
        .fetch_one(&self.pool)
        .await?;

        // Step 12: book-keeping. Best-effort: failures are logged, never roll
        // back the persisted generation.
        if let Err(e) = self.cache.set_dedup(&hash, generation.id).await {
            warn!(generation_id = generation.id, error = %e, "dedup cache-set failed");
        }
        if let Some(key) = &cache_key {
            if let Err(e) = self.cache.set_cache(key, generation.id, options.cache_strategy).await {
                warn!(generation_id = generation.id, error = %e, "cache-set failed");
            }
        }

        // Step 13: enqueue.
        if let Err(e) = self
            .queue
            .enqueue(&Task::ProcessGeneration { generation_id: generation.id })
            .await
        {
            warn!(generation_id = generation.id, error = %e, "enqueue failed, relying on requeue sweep");
        }

        // Step 14: publish JOB_CREATED.
        if let Err(e) = self
            .events
            .publish(
                Topic::JobCreated,
                JobEvent {
                    generation_id: generation.id,
                    user_id,
                    status: generation.status.to_string(),
                    error: None,
                    occurred_at: Utc::now(),
                },
            )
            .await
        {
            warn!(generation_id = generation.id, error = %e, "event publish failed");
        }

        info!(generation_id = generation.id, %provider_id, "generation created");
        Ok(generation)
    }

    /// Loads `existing_id` and returns it unless its status is FAILED, in
    /// which case the matching cache entry is invalidated so the caller
    /// proceeds to create a fresh one.
    async fn load_if_reusable(
        &self,
        existing_id: i64,
        hash: &str,
        cache_key: Option<&str>,
    ) -> Result<Option<Generation>, CreationError> {
        let existing = sqlx::query_as::<_, Generation>("SELECT * FROM generations WHERE id = $1")
            .bind(existing_id)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            Some(generation) if generation.status != GenerationStatus::Failed => Ok(Some(generation)),
            Some(_failed) => {
                let _ = self.cache.invalidate_dedup(hash).await;
                if let Some(key) = cache_key {
                    let _ = self.cache.invalidate_cache(key).await;
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn resolve_prompt_version(
        &self,
        params: &CreateRequestParams,
        explicit_id: Option<i64>,
    ) -> Result<Option<i64>, CreationError> {
        if let Some(id) = explicit_id {
            return Ok(Some(id));
        }
        let Some(raw_prompt) = &params.generation_config.prompt else {
            return Ok(None);
        };
        let normalized = normalize_prompt_text(raw_prompt);
        if normalized.is_empty() {
            return Ok(None);
        }
        let hash = prompt_text_hash(&normalized);

        if let Some(existing) =
            sqlx::query_as::<_, PromptVersion>("SELECT * FROM prompt_versions WHERE text_hash = $1")
                .bind(&hash)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(Some(existing.id));
        }

        let created = sqlx::query_as::<_, PromptVersion>(
            "INSERT INTO prompt_versions (text_hash, normalized_text, analysis, created_at) \
             VALUES ($1, $2, NULL, now()) \
             ON CONFLICT (text_hash) DO UPDATE SET text_hash = EXCLUDED.text_hash \
             RETURNING *",
        )
        .bind(&hash)
        .bind(&normalized)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(created.id))
    }
}

fn validate_operation_fields(
    operation: OperationType,
    params: &CreateRequestParams,
) -> Result<(), CreationError> {
    let config = &params.generation_config;
    let nonempty_prompt = config.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());

    match operation {
        OperationType::TextToVideo | OperationType::ImageToImage => {
            if !nonempty_prompt {
                return Err(CreationError::InvalidOperation("prompt is required".into()));
            }
            if operation == OperationType::ImageToImage {
                let has_images = config.image_urls.as_ref().is_some_and(|v| !v.is_empty())
                    || config.image_url.is_some();
                if !has_images {
                    return Err(CreationError::InvalidOperation(
                        "image_urls or image_url is required".into(),
                    ));
                }
            }
        }
        OperationType::ImageToVideo => {
            if !nonempty_prompt {
                return Err(CreationError::InvalidOperation("prompt is required".into()));
            }
            if config.image_url.is_none() {
                return Err(CreationError::InvalidOperation("image_url is required".into()));
            }
        }
        OperationType::VideoExtend => {
            if config.video_url.is_none() && config.original_video_id.is_none() {
                return Err(CreationError::InvalidOperation(
                    "video_url or original_video_id is required".into(),
                ));
            }
        }
        OperationType::VideoTransition => {
            let image_urls = config.image_urls.as_deref().unwrap_or_default();
            let prompts = config.prompts.as_deref().unwrap_or_default();
            if image_urls.len() < 2 {
                return Err(CreationError::InvalidOperation(
                    "image_urls must have at least 2 entries".into(),
                ));
            }
            if prompts.len() != image_urls.len() - 1 {
                return Err(CreationError::InvalidOperation(format!(
                    "prompts must have exactly {} entries",
                    image_urls.len() - 1
                )));
            }
        }
        OperationType::Fusion => {
            if !nonempty_prompt {
                return Err(CreationError::InvalidOperation("prompt is required".into()));
            }
        }
    }
    Ok(())
}

/// Lift provider-agnostic fields and the active provider's `style.<id>.*`
/// block to the top level.
fn canonicalize(
    operation: OperationType,
    provider_id: &str,
    params: &CreateRequestParams,
) -> CanonicalParams {
    let provider_style = params
        .generation_config
        .style
        .as_ref()
        .and_then(|style| style.per_provider.get(provider_id))
        .and_then(Value::as_object)
        .map(|obj| obj.clone().into_iter().collect())
        .unwrap_or_default();

    CanonicalParams {
        operation: operation.as_str().to_string(),
        provider_id: provider_id.to_string(),
        duration_target: params.generation_config.duration.as_ref().and_then(|d| d.target),
        constraint_rating: params.generation_config.constraints.as_ref().and_then(|c| c.rating.clone()),
        style_pacing: params.generation_config.style.as_ref().and_then(|s| s.pacing.clone()),
        provider_style,
        scene_context: params.scene_context.clone(),
        player_context: params.player_context.clone(),
        social_context: params.social_context.clone(),
        generation_config: params.generation_config.clone(),
    }
}

/// Derive ordered scene references from `scene_context`.
fn extract_inputs(params: &CreateRequestParams) -> Inputs {
    let mut inputs = Inputs::new();
    if let Some(from) = &params.scene_context.from_scene {
        if let Some(id) = &from.id {
            inputs.push(id.clone());
        }
    }
    if let Some(to) = &params.scene_context.to_scene {
        if let Some(id) = &to.id {
            inputs.push(id.clone());
        }
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::params::{GenerationConfig, SceneContext, SceneRef, SocialContext};

    #[test]
    fn validate_rejects_video_extend_without_source() {
        let mut params = CreateRequestParams::default();
        params.generation_config.prompt = Some("hello".into());
        let err = validate_operation_fields(OperationType::VideoExtend, &params).unwrap_err();
        assert!(matches!(err, CreationError::InvalidOperation(_)));
    }

    #[test]
    fn validate_video_transition_requires_prompts_len_minus_one() {
        let mut params = CreateRequestParams::default();
        params.generation_config.image_urls = Some(vec!["a".into(), "b".into(), "c".into()]);
        params.generation_config.prompts = Some(vec!["p1".into()]);
        assert!(validate_operation_fields(OperationType::VideoTransition, &params).is_err());

        params.generation_config.prompts = Some(vec!["p1".into(), "p2".into()]);
        assert!(validate_operation_fields(OperationType::VideoTransition, &params).is_ok());
    }

    #[test]
    fn extract_inputs_pulls_scene_ids() {
        let params = CreateRequestParams {
            scene_context: SceneContext {
                from_scene: Some(SceneRef { id: Some("s1".into()), extra: Default::default() }),
                to_scene: Some(SceneRef { id: Some("s2".into()), extra: Default::default() }),
                extra: Default::default(),
            },
            generation_config: GenerationConfig::default(),
            player_context: Default::default(),
            social_context: SocialContext::default(),
        };
        assert_eq!(extract_inputs(&params), vec!["s1".to_string(), "s2".to_string()]);
    }
}
