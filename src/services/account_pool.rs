use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::adapters::AdapterError;
use crate::domain::account::ProviderAccount;

/// Errors surfaced to the queue (not the HTTP caller) so the task can be
/// retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum AccountPoolError {
    #[error("no account available for provider {provider_id}")]
    NoAccountAvailable { provider_id: String },

    #[error("all candidate accounts for provider {provider_id} are in cooldown until {earliest_expiry}")]
    AccountCooldown {
        provider_id: String,
        earliest_expiry: DateTime<Utc>,
    },

    #[error("account {account_id} has no remaining credit balance")]
    AccountExhausted { account_id: i64 },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Account selection + reservation.
#[derive(Clone)]
pub struct AccountPool {
    pool: PgPool,
}

impl AccountPool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Choose a [`ProviderAccount`] for `provider_id` with available quota and
    /// atomically reserve it. Candidate ordering: highest total remaining
    /// credits descending, then least-recently-used, then lowest id.
    pub async fn select_and_reserve_account(
        &self,
        provider_id: &str,
        _user_id: i64,
    ) -> Result<ProviderAccount, AccountPoolError> {
        let now = Utc::now();

        let candidates: Vec<ProviderAccount> = sqlx::query_as::<_, ProviderAccount>(
            r#"
            SELECT id, provider_id, credentials, credits, current_processing_jobs,
                   max_concurrent, cooldown_until, estimated_eta_secs, last_used_at, created_at
            FROM provider_accounts
            WHERE provider_id = $1
              AND current_processing_jobs < max_concurrent
              AND (cooldown_until IS NULL OR cooldown_until <= $2)
            ORDER BY
                (SELECT COALESCE(SUM(value::bigint), 0) FROM jsonb_each_text(credits)) DESC,
                last_used_at ASC NULLS FIRST,
                id ASC
            "#,
        )
        .bind(provider_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        if candidates.is_empty() {
            if let Some(earliest) = self.earliest_cooldown_expiry(provider_id).await? {
                return Err(AccountPoolError::AccountCooldown {
                    provider_id: provider_id.to_string(),
                    earliest_expiry: earliest,
                });
            }
            return Err(AccountPoolError::NoAccountAvailable {
                provider_id: provider_id.to_string(),
            });
        }

        for candidate in &candidates {
            if !candidate.has_any_balance() {
                continue;
            }
            let reserved = sqlx::query_as::<_, ProviderAccount>(
                r#"
                UPDATE provider_accounts
                SET current_processing_jobs = current_processing_jobs + 1,
                    last_used_at = $2
                WHERE id = $1
                  AND current_processing_jobs < max_concurrent
                RETURNING id, provider_id, credentials, credits, current_processing_jobs,
                          max_concurrent, cooldown_until, estimated_eta_secs, last_used_at, created_at
                "#,
            )
            .bind(candidate.id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(account) = reserved {
                info!(account_id = account.id, provider_id, "reserved provider account");
                return Ok(account);
            }
            // Lost the race to another worker; try the next candidate.
        }

        Err(AccountPoolError::NoAccountAvailable {
            provider_id: provider_id.to_string(),
        })
    }

    async fn earliest_cooldown_expiry(
        &self,
        provider_id: &str,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(cooldown_until) FROM provider_accounts WHERE provider_id = $1 AND cooldown_until > now()",
        )
        .bind(provider_id)
        .fetch_one(&self.pool)
        .await
    }

    /// Decrement the reservation counter if it is currently positive.
    /// Invoked from terminal transitions and `reconcile_counters`.
    pub async fn release_account(&self, account_id: i64) -> Result<(), AccountPoolError> {
        sqlx::query(
            "UPDATE provider_accounts SET current_processing_jobs = GREATEST(current_processing_jobs - 1, 0) WHERE id = $1",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a provider auth/quota failure and set an exponential cooldown,
    /// then release the reservation.
    pub async fn record_provider_error(
        &self,
        account_id: i64,
        error: &AdapterError,
    ) -> Result<(), AccountPoolError> {
        self.release_account(account_id).await?;

        let should_cooldown = matches!(
            error,
            AdapterError::Authentication { .. } | AdapterError::QuotaExceeded { .. }
        );
        if !should_cooldown {
            return Ok(());
        }

        let consecutive_failures: i32 = sqlx::query_scalar(
            "SELECT consecutive_failures FROM provider_accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        let backoff_secs = 30i64 * 2i64.pow(consecutive_failures.clamp(0, 8) as u32);
        let until = Utc::now() + ChronoDuration::seconds(backoff_secs);

        sqlx::query(
            "UPDATE provider_accounts SET cooldown_until = $2, consecutive_failures = consecutive_failures + 1 WHERE id = $1",
        )
        .bind(account_id)
        .bind(until)
        .execute(&self.pool)
        .await?;

        warn!(account_id, until = %until, "account placed in cooldown after provider error");
        Ok(())
    }

    pub async fn get_credits(
        &self,
        account_id: i64,
    ) -> Result<std::collections::BTreeMap<String, i64>, AccountPoolError> {
        let row: sqlx::types::Json<std::collections::BTreeMap<String, i64>> =
            sqlx::query_scalar("SELECT credits FROM provider_accounts WHERE id = $1")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    /// The only mutation path for credit balances. Fails if the account's
    /// balance for `credit_type` is below `amount`.
    pub async fn deduct_credit(
        &self,
        account_id: i64,
        credit_type: &str,
        amount: i64,
    ) -> Result<(), AccountPoolError> {
        let result = sqlx::query(
            r#"
            UPDATE provider_accounts
            SET credits = jsonb_set(
                credits,
                ARRAY[$2],
                to_jsonb((COALESCE((credits->>$2)::bigint, 0) - $3))
            )
            WHERE id = $1 AND COALESCE((credits->>$2)::bigint, 0) >= $3
            "#,
        )
        .bind(account_id)
        .bind(credit_type)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccountPoolError::AccountExhausted { account_id });
        }
        Ok(())
    }

    /// Recompute `current_processing_jobs` from the actual count of
    /// PROCESSING generations + analyses and clamp the stored counter.
    /// Run on startup and every 5 minutes.
    pub async fn reconcile_counters(&self) -> Result<u64, AccountPoolError> {
        let result = sqlx::query(
            r#"
            UPDATE provider_accounts pa
            SET current_processing_jobs = actual.count
            FROM (
                SELECT account_id, COUNT(*) AS count FROM (
                    SELECT account_id FROM generations WHERE status = 'PROCESSING' AND account_id IS NOT NULL
                    UNION ALL
                    SELECT account_id FROM analyses WHERE status = 'PROCESSING' AND account_id IS NOT NULL
                ) combined
                GROUP BY account_id
            ) actual
            WHERE pa.id = actual.account_id AND pa.current_processing_jobs <> actual.count
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Accounts with zero in-flight work never appear in `actual` above; they
        // still need clamping down to zero if drift left them non-zero.
        let zeroed = sqlx::query(
            r#"
            UPDATE provider_accounts
            SET current_processing_jobs = 0
            WHERE current_processing_jobs <> 0
              AND id NOT IN (
                  SELECT account_id FROM generations WHERE status = 'PROCESSING' AND account_id IS NOT NULL
                  UNION
                  SELECT account_id FROM analyses WHERE status = 'PROCESSING' AND account_id IS NOT NULL
              )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() + zeroed.rows_affected())
    }
}
