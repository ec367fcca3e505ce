use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::adapters::GenerationStatusHint;
use crate::domain::account::ProviderAccount;
use crate::domain::analysis::Analysis;
use crate::domain::asset::MediaType;
use crate::domain::generation::{Generation, GenerationStatus};
use crate::domain::submission::ProviderSubmission;
use crate::events::{EventBus, JobEvent, Topic};
use crate::queue::{Queue, Task};
use crate::services::account_pool::AccountPool;
use crate::services::billing::BillingFinalizer;
use crate::services::ingestor::AssetIngestor;
use crate::services::retry::RetryController;
use crate::adapters::Registry;

/// Status Poller.
#[derive(Clone)]
pub struct StatusPoller {
    pool: PgPool,
    registry: Registry,
    account_pool: AccountPool,
    billing: BillingFinalizer,
    retry: RetryController,
    ingestor: AssetIngestor,
    events: EventBus,
    generation_timeout_secs: i64,
    analysis_timeout_secs: i64,
}

impl StatusPoller {
    pub fn new(
        pool: PgPool,
        registry: Registry,
        account_pool: AccountPool,
        billing: BillingFinalizer,
        retry: RetryController,
        ingestor: AssetIngestor,
        events: EventBus,
        generation_timeout_secs: i64,
        analysis_timeout_secs: i64,
    ) -> Self {
        Self {
            pool,
            registry,
            account_pool,
            billing,
            retry,
            ingestor,
            events,
            generation_timeout_secs,
            analysis_timeout_secs,
        }
    }

    /// Cron tick (default every 10s): advance every PROCESSING generation.
    pub async fn poll_job_statuses(&self) -> u64 {
        let processing = sqlx::query_as::<_, Generation>(
            "SELECT * FROM generations WHERE status = 'PROCESSING' ORDER BY started_at ASC NULLS LAST",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to load processing generations");
            Vec::new()
        });

        let count = processing.len() as u64;
        for generation in processing {
            if let Err(e) = self.poll_one(&generation).await {
                warn!(generation_id = generation.id, error = %e, "status poll failed");
            }
        }
        count
    }

    async fn poll_one(&self, generation: &Generation) -> Result<(), sqlx::Error> {
        let submission = sqlx::query_as::<_, ProviderSubmission>(
            "SELECT * FROM provider_submissions WHERE generation_id = $1 ORDER BY submitted_at DESC LIMIT 1",
        )
        .bind(generation.id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(submission) = submission else {
            self.fail_and_release(generation, "no submission", generation.account_id).await?;
            return Ok(());
        };

        if let Some(started_at) = generation.started_at {
            let age = Utc::now() - started_at;
            if age.num_seconds() > self.generation_timeout_secs {
                self.fail_and_release(generation, "timeout", Some(submission.account_id)).await?;
                return Ok(());
            }
        }

        let Some(adapter) = self.registry.get(&generation.provider_id) else {
            self.fail_and_release(generation, "provider no longer registered", Some(submission.account_id))
                .await?;
            return Ok(());
        };

        let account = sqlx::query_as::<_, ProviderAccount>("SELECT * FROM provider_accounts WHERE id = $1")
            .bind(submission.account_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(account) = account else {
            self.fail_and_release(generation, "reserved account no longer exists", Some(submission.account_id))
                .await?;
            return Ok(());
        };

        let status = match adapter.check_status(&account, &submission.provider_job_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(generation_id = generation.id, error = %e, "check_status failed, leaving PROCESSING");
                return Ok(());
            }
        };

        match status.status {
            GenerationStatusHint::Processing => Ok(()),
            GenerationStatusHint::Completed => {
                self.complete(generation, &submission, &account, &status.urls, status.duration_secs)
                    .await
            }
            GenerationStatusHint::Failed | GenerationStatusHint::Filtered | GenerationStatusHint::Cancelled => {
                let message = status.error_message.unwrap_or_else(|| "provider reported failure".to_string());
                self.fail_and_release(generation, &message, Some(account.id)).await?;
                Ok(())
            }
        }
    }

    async fn complete(
        &self,
        generation: &Generation,
        submission: &ProviderSubmission,
        account: &ProviderAccount,
        urls: &[String],
        actual_duration: Option<f64>,
    ) -> Result<(), sqlx::Error> {
        let media_type = if generation.operation.as_str().contains("video") {
            MediaType::Video
        } else {
            MediaType::Image
        };

        let ingest_result = self
            .ingestor
            .ingest_completed(media_type, urls, submission.response.clone())
            .await;

        let asset_id = match ingest_result {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(generation_id = generation.id, error = %e, "asset ingestion failed");
                None
            }
        };

        if generation.guard_transition(GenerationStatus::Completed, false).is_err() {
            return Ok(());
        }

        let Some(updated) = sqlx::query_as::<_, Generation>(
            r#"
            UPDATE generations
            SET status = 'COMPLETED', asset_id = $2, completed_at = now(), updated_at = now()
            WHERE id = $1 AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            RETURNING *
            "#,
        )
        .bind(generation.id)
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            warn!(generation_id = generation.id, "complete: generation already reached a terminal state, skipping side effects");
            let _ = self.account_pool.release_account(account.id).await;
            return Ok(());
        };

        self.billing.finalize_billing(&updated, Some(account), actual_duration).await;
        let _ = self.account_pool.release_account(account.id).await;
        let _ = self.account_pool.get_credits(account.id).await;

        let _ = self
            .events
            .publish(
                Topic::JobCompleted,
                JobEvent {
                    generation_id: updated.id,
                    user_id: updated.user_id,
                    status: GenerationStatus::Completed.to_string(),
                    error: None,
                    occurred_at: Utc::now(),
                },
            )
            .await;

        info!(generation_id = updated.id, "generation completed");
        Ok(())
    }

    async fn fail_and_release(
        &self,
        generation: &Generation,
        message: &str,
        account_id: Option<i64>,
    ) -> Result<(), sqlx::Error> {
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
            warn!(generation_id = generation.id, "fail_and_release: generation already reached a terminal state, skipping side effects");
            if let Some(account_id) = account_id {
                let _ = self.account_pool.release_account(account_id).await;
            }
            return Ok(());
        };

        self.billing.finalize_billing(&updated, None, None).await;

        if let Some(account_id) = account_id {
            let _ = self.account_pool.release_account(account_id).await;
            let _ = self.account_pool.get_credits(account_id).await;
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

    /// Cron tick (default every 30s): recover PENDING generations that a
    /// worker failed to enqueue.
    pub async fn requeue_pending_generations(
        &self,
        queue: &Queue,
        staleness_secs: i64,
        batch_cap: i64,
    ) -> u64 {
        let stale = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM generations
            WHERE status = 'PENDING' AND created_at < now() - ($1 || ' seconds')::interval
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(staleness_secs.to_string())
        .bind(batch_cap)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to load stale pending generations");
            Vec::new()
        });

        let mut requeued = 0u64;
        for generation_id in stale {
            if queue.enqueue(&Task::ProcessGeneration { generation_id }).await.is_ok() {
                requeued += 1;
            }
        }
        requeued
    }

    /// Analogous recovery sweep for Analysis rows. `Analysis` carries no
    /// `created_at`, so staleness here is "never started" rather than
    /// "older than N seconds".
    pub async fn requeue_pending_analyses(&self, queue: &Queue, batch_cap: i64) -> u64 {
        let pending = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM analyses WHERE status = 'PENDING' AND started_at IS NULL ORDER BY id ASC LIMIT $1",
        )
        .bind(batch_cap)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        let mut requeued = 0u64;
        for analysis_id in pending {
            if queue.enqueue(&Task::ProcessAnalysis { analysis_id }).await.is_ok() {
                requeued += 1;
            }
        }
        requeued
    }

    /// Shorter-timeout sibling path for Analysis rows: since `Analysis`
    /// carries no provider linkage, this path only enforces the timeout,
    /// not live status polling.
    pub async fn poll_analysis_timeouts(&self) -> u64 {
        let timed_out = sqlx::query_as::<_, Analysis>(
            r#"
            SELECT * FROM analyses
            WHERE status = 'PROCESSING'
              AND started_at IS NOT NULL
              AND started_at < now() - ($1 || ' seconds')::interval
            "#,
        )
        .bind(self.analysis_timeout_secs.to_string())
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        let count = timed_out.len() as u64;
        for analysis in timed_out {
            let _ = sqlx::query(
                "UPDATE analyses SET status = 'FAILED', error_message = 'timeout', completed_at = now() WHERE id = $1",
            )
            .bind(analysis.id)
            .execute(&self.pool)
            .await;
            if let Some(account_id) = analysis.account_id {
                let _ = self.account_pool.release_account(account_id).await;
            }
        }
        count
    }
}
