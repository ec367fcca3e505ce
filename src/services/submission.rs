use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::adapters::{AdapterError, Registry};
use crate::domain::generation::{Generation, GenerationStatus};
use crate::events::{EventBus, JobEvent, Topic};
use crate::services::account_pool::AccountPool;
use crate::services::billing::BillingFinalizer;
use crate::services::retry::RetryController;

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error(transparent)]
    AccountPool(#[from] crate::services::account_pool::AccountPoolError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Submission Pipeline: dispatches a PENDING generation to its provider.
#[derive(Clone)]
pub struct SubmissionPipeline {
    pool: PgPool,
    registry: Registry,
    account_pool: AccountPool,
    billing: BillingFinalizer,
    retry: RetryController,
    events: EventBus,
}

impl SubmissionPipeline {
    pub fn new(
        pool: PgPool,
        registry: Registry,
        account_pool: AccountPool,
        billing: BillingFinalizer,
        retry: RetryController,
        events: EventBus,
    ) -> Self {
        Self { pool, registry, account_pool, billing, retry, events }
    }

    pub async fn process_generation(&self, generation_id: i64) -> Result<(), SubmissionError> {
        let Some(generation) =
            sqlx::query_as::<_, Generation>("SELECT * FROM generations WHERE id = $1")
                .bind(generation_id)
                .fetch_optional(&self.pool)
                .await?
        else {
            warn!(generation_id, "process_generation: generation disappeared");
            return Ok(());
        };

        // Step 1: idempotent exit if already past PENDING.
        if generation.status != GenerationStatus::Pending {
            return Ok(());
        }

        // Step 2: scheduled-for-later generations wait for the cron sweep.
        if let Some(scheduled_at) = generation.scheduled_at {
            if scheduled_at > Utc::now() {
                return Ok(());
            }
        }

        let Some(adapter) = self.registry.get(&generation.provider_id) else {
            self.fail(&generation, "provider no longer registered", None).await?;
            return Ok(());
        };

        // Step 3: account reservation. Propagated to the caller so the queue
        // retries the whole task with backoff rather than busy-looping here.
        let account = self
            .account_pool
            .select_and_reserve_account(&generation.provider_id, generation.user_id)
            .await?;

        // Step 4: PENDING -> PROCESSING, guarded so a concurrent cancel can't
        // be clobbered by a pipeline run that started before it landed.
        if generation.guard_transition(GenerationStatus::Processing, false).is_err() {
            return Ok(());
        }

        let Some(generation) = sqlx::query_as::<_, Generation>(
            "UPDATE generations SET status = 'PROCESSING', started_at = now(), updated_at = now(), account_id = $2 WHERE id = $1 AND status = 'PENDING' RETURNING *",
        )
        .bind(generation.id)
        .bind(account.id)
        .fetch_optional(&self.pool)
        .await?
        else {
            warn!(generation_id = generation.id, "process_generation: lost PENDING -> PROCESSING race, releasing account");
            let _ = self.account_pool.release_account(account.id).await;
            return Ok(());
        };

        let _ = self
            .events
            .publish(
                Topic::JobStarted,
                JobEvent {
                    generation_id: generation.id,
                    user_id: generation.user_id,
                    status: GenerationStatus::Processing.to_string(),
                    error: None,
                    occurred_at: Utc::now(),
                },
            )
            .await;

        let canonical_params: crate::domain::params::CanonicalParams =
            serde_json::from_value(generation.canonical_params.clone()).unwrap_or_default();

        // Step 5: map parameters, execute.
        let payload = match adapter.map_parameters(generation.operation, &canonical_params) {
            Ok(payload) => payload,
            Err(err) => {
                self.handle_adapter_error(&generation, account.id, err).await?;
                return Ok(());
            }
        };

        match adapter.execute(generation.operation, &account, payload).await {
            Ok(submission) => {
                sqlx::query(
                    r#"
                    INSERT INTO provider_submissions
                        (generation_id, account_id, provider_job_id, submitted_at, response, status, estimated_completion)
                    VALUES ($1, $2, $3, now(), $4, $5, $6)
                    "#,
                )
                .bind(generation.id)
                .bind(account.id)
                .bind(&submission.provider_job_id)
                .bind(&submission.metadata)
                .bind(status_hint_str(submission.initial_status))
                .bind(submission.estimated_completion)
                .execute(&self.pool)
                .await?;

                info!(generation_id = generation.id, account_id = account.id, "submitted to provider");
                Ok(())
            }
            Err(err) => {
                self.handle_adapter_error(&generation, account.id, err).await?;
                Ok(())
            }
        }
    }

    async fn handle_adapter_error(
        &self,
        generation: &Generation,
        account_id: i64,
        err: AdapterError,
    ) -> Result<(), SubmissionError> {
        error!(generation_id = generation.id, error = %err, "submission failed");
        if let Err(e) = self.account_pool.record_provider_error(account_id, &err).await {
            warn!(generation_id = generation.id, error = %e, "failed to record provider error");
        }
        self.fail(generation, &err.to_string(), Some(account_id)).await
    }

    async fn fail(
        &self,
        generation: &Generation,
        message: &str,
        account_id: Option<i64>,
    ) -> Result<(), SubmissionError> {
        if generation.guard_transition(GenerationStatus::Failed, false).is_err() {
            return Ok(());
        }

        let Some(updated) = sqlx::query_as::<_, Generation>(
            r#"
            UPDATE generations
            SET status = 'FAILED', error_message = $2, completed_at = now(), updated_at = now()
            WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            RETURNING *
            "#,
        )
        .bind(generation.id)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?
        else {
            warn!(generation_id = generation.id, "fail: generation already reached a terminal state, skipping side effects");
            if let Some(account_id) = account_id {
                let _ = self.account_pool.release_account(account_id).await;
            }
            return Ok(());
        };

        self.billing.finalize_billing(&updated, None, None).await;

        if let Some(account_id) = account_id {
            let _ = self.account_pool.release_account(account_id).await;
        }

        let _ = self
            .events
            .publish(
                Topic::JobFailed,
                JobEvent {
                    generation_id: updated.id,
                    user_id: updated.user_id,
                    status: GenerationStatus::Failed.to_string(),
                    error: Some(message.to_string()),
                    occurred_at: Utc::now(),
                },
            )
            .await;

        self.retry.handle_failure(&updated).await;
        Ok(())
    }
}

fn status_hint_str(hint: crate::adapters::GenerationStatusHint) -> &'static str {
    use crate::adapters::GenerationStatusHint::*;
    match hint {
        Processing => "PROCESSING",
        Completed => "COMPLETED",
        Failed => "FAILED",
        Filtered => "FILTERED",
        Cancelled => "CANCELLED",
    }
}
