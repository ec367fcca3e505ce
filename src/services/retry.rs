use sqlx::PgPool;
use tracing::{info, warn};

use crate::domain::generation::{Generation, GenerationStatus};
use crate::queue::{Queue, Task};

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
    #[error("generation {0} is not in a retryable terminal state")]
    NotTerminal(i64),
}

/// Retry Controller.
#[derive(Clone)]
pub struct RetryController {
    pool: PgPool,
    queue: Queue,
    max_attempts: i32,
    auto_retry_enabled: bool,
}

impl RetryController {
    pub fn new(pool: PgPool, queue: Queue, max_attempts: i32, auto_retry_enabled: bool) -> Self {
        Self { pool, queue, max_attempts, auto_retry_enabled }
    }

    /// Invoked by the submission pipeline and the status poller whenever a
    /// generation lands in FAILED. Best-effort: failures here are logged,
    /// never surfaced, since the generation has already reached a terminal
    /// state regardless of whether auto-retry succeeds.
    pub async fn handle_failure(&self, generation: &Generation) {
        if generation.status != GenerationStatus::Failed {
            return;
        }
        if !self.auto_retry_enabled {
            return;
        }
        let message = generation.error_message.as_deref().unwrap_or("");
        if !is_retryable(message) {
            info!(generation_id = generation.id, "failure classified as non-retryable, no auto-retry");
            return;
        }
        if generation.retry_count >= self.max_attempts {
            info!(generation_id = generation.id, retry_count = generation.retry_count, "max retry attempts reached");
            return;
        }

        match self.requeue_same_row(generation.id).await {
            Ok(()) => info!(generation_id = generation.id, "auto-retry requeued"),
            Err(e) => warn!(generation_id = generation.id, error = %e, "auto-retry requeue failed"),
        }
    }

    /// Reuses the same row: increments `retry_count`, resets lifecycle
    /// fields to PENDING, and re-enqueues. The original failure reason
    /// remains in `error_message` until overwritten by the next attempt.
    async fn requeue_same_row(&self, generation_id: i64) -> Result<(), RetryError> {
        let updated = sqlx::query_as::<_, Generation>(
            r#"
            UPDATE generations
            SET status = 'PENDING',
                retry_count = retry_count + 1,
                started_at = NULL,
                completed_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'FAILED'
            RETURNING *
            "#,
        )
        .bind(generation_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(_updated) = updated else {
            warn!(generation_id, "requeue_same_row: generation left FAILED before auto-retry ran, skipping");
            return Ok(());
        };

        if let Err(e) = self.queue.enqueue(&Task::ProcessGeneration { generation_id }).await {
            warn!(generation_id, error = %e, "failed to enqueue auto-retry, relying on requeue sweep");
        }
        Ok(())
    }

    /// `POST /api/v1/generations/{id}/retry`: creates a *new* Generation
    /// linked via `parent_generation_id`, copying `raw_params`, with
    /// `retry_count = parent.retry_count + 1`.
    pub async fn create_retry(&self, generation_id: i64) -> Result<Generation, RetryError> {
        let parent = sqlx::query_as::<_, Generation>("SELECT * FROM generations WHERE id = $1")
            .bind(generation_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RetryError::NotTerminal(generation_id))?;

        if !parent.status.is_terminal() {
            return Err(RetryError::NotTerminal(generation_id));
        }

        let created = sqlx::query_as::<_, Generation>(
            r#"
            INSERT INTO generations (
                user_id, operation, provider_id, raw_params, canonical_params, inputs,
                reproducible_hash, status, billing_state, retry_count, parent_generation_id,
                prompt_version_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING', 'UNCHARGED', $8, $9, $10, now(), now())
            RETURNING *
            "#,
        )
        .bind(parent.user_id)
        .bind(parent.operation)
        .bind(&parent.provider_id)
        .bind(&parent.raw_params)
        .bind(&parent.canonical_params)
        .bind(&parent.inputs)
        .bind(format!("{}:retry:{}", parent.reproducible_hash, parent.retry_count + 1))
        .bind(parent.retry_count + 1)
        .bind(parent.id)
        .bind(parent.prompt_version_id)
        .fetch_one(&self.pool)
        .await?;

        self.queue.enqueue(&Task::ProcessGeneration { generation_id: created.id }).await?;

        Ok(created)
    }
}

/// Classify a FAILED generation's error message for auto-retry eligibility.
/// Non-retryable: prompt/input rejection, auth, quota. Retryable: timeout,
/// rate limit, transient 5xx, output-side content filter.
fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    let non_retryable_markers = [
        "authentication",
        "unauthorized",
        "quota exceeded",
        "content filtered (input)",
        "content filtered (prompt)",
        "invalid operation",
        "unsupported",
    ];
    if non_retryable_markers.iter().any(|marker| lower.contains(marker)) {
        return false;
    }

    let retryable_markers = [
        "timeout",
        "timed out",
        "rate limit",
        "too many requests",
        "5xx",
        "server error",
        "content filtered (output)",
        "no submission",
    ];
    retryable_markers.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failures_are_not_retryable() {
        assert!(!is_retryable("authentication failed for provider pixverse"));
    }

    #[test]
    fn timeouts_are_retryable() {
        assert!(is_retryable("request timed out after 10s"));
    }

    #[test]
    fn output_content_filter_is_retryable_but_input_is_not() {
        assert!(is_retryable("Content filtered (output)"));
        assert!(!is_retryable("Content filtered (prompt)"));
    }
}
