use sqlx::PgPool;
use tracing::{error, warn};

use crate::adapters::Registry;
use crate::domain::account::ProviderAccount;
use crate::domain::generation::{BillingState, Generation, GenerationStatus};
use crate::services::account_pool::AccountPool;

const CREDIT_TYPE_PREFERENCE: [&str; 2] = ["web", "openapi"];

/// Billing Finalizer. Always persists a terminal billing outcome; never
/// propagates an error to its caller. Failures are captured in
/// `billing_error` on the row itself.
#[derive(Clone)]
pub struct BillingFinalizer {
    pool: PgPool,
    registry: Registry,
    account_pool: AccountPool,
}

impl BillingFinalizer {
    pub fn new(pool: PgPool, registry: Registry, account_pool: AccountPool) -> Self {
        Self { pool, registry, account_pool }
    }

    pub async fn finalize_billing(
        &self,
        generation: &Generation,
        account: Option<&ProviderAccount>,
        actual_duration: Option<f64>,
    ) {
        if matches!(generation.billing_state, BillingState::Charged | BillingState::Skipped) {
            return;
        }
        if !matches!(
            generation.status,
            GenerationStatus::Completed | GenerationStatus::Failed | GenerationStatus::Cancelled
        ) {
            return;
        }

        if generation.status != GenerationStatus::Completed {
            if let Err(e) = self.persist(generation.id, BillingState::Skipped, 0, None, None, None).await {
                error!(generation_id = generation.id, error = %e, "failed to persist SKIPPED billing state");
            }
            return;
        }

        self.finalize_completed(generation, account, actual_duration).await;
    }

    async fn finalize_completed(
        &self,
        generation: &Generation,
        account: Option<&ProviderAccount>,
        actual_duration: Option<f64>,
    ) {
        let resolved_account = match account {
            Some(account) => Some(account.clone()),
            None => match generation.account_id {
                Some(id) => self.load_account(id).await,
                None => None,
            },
        };

        let Some(account) = resolved_account else {
            self.persist_failed(generation.id, "no account resolvable for billing", None).await;
            return;
        };

        let Some(adapter) = self.registry.get(&generation.provider_id) else {
            self.persist_failed(generation.id, "provider no longer registered", Some(account.id)).await;
            return;
        };

        let actual_credits = adapter.compute_actual_credits(generation, actual_duration);
        if actual_credits <= 0 {
            if let Err(e) = self
                .persist(generation.id, BillingState::Skipped, 0, None, Some(account.id), None)
                .await
            {
                error!(generation_id = generation.id, error = %e, "failed to persist SKIPPED billing state");
            }
            return;
        }

        let credit_type = match &generation.credit_type {
            Some(existing) => Some(existing.clone()),
            None => preferred_credit_type(&account),
        };

        let Some(credit_type) = credit_type else {
            self.persist_failed(generation.id, "no credit pool with balance", Some(account.id)).await;
            return;
        };

        match self.account_pool.deduct_credit(account.id, &credit_type, actual_credits).await {
            Ok(()) => {
                if let Err(e) = self
                    .persist(
                        generation.id,
                        BillingState::Charged,
                        actual_credits,
                        Some(&credit_type),
                        Some(account.id),
                        None,
                    )
                    .await
                {
                    error!(generation_id = generation.id, error = %e, "failed to persist CHARGED billing state");
                }
            }
            Err(e) => {
                self.persist_failed(generation.id, &e.to_string(), Some(account.id)).await;
            }
        }
    }

    async fn persist_failed(&self, generation_id: i64, message: &str, account_id: Option<i64>) {
        if let Err(e) = self
            .persist(generation_id, BillingState::Failed, 0, None, account_id, Some(message))
            .await
        {
            error!(generation_id, error = %e, "failed to persist FAILED billing state");
        }
        warn!(generation_id, billing_error = message, "billing finalization failed");
    }

    async fn persist(
        &self,
        generation_id: i64,
        billing_state: BillingState,
        actual_credits: i64,
        credit_type: Option<&str>,
        account_id: Option<i64>,
        billing_error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let charged_at_now = billing_state == BillingState::Charged;
        sqlx::query(
            r#"
            UPDATE generations
            SET billing_state = $2,
                actual_credits = $3,
                credit_type = COALESCE($4, credit_type),
                account_id = COALESCE($5, account_id),
                billing_error = $6,
                charged_at = CASE WHEN $7 THEN now() ELSE charged_at END
            WHERE id = $1
            "#,
        )
        .bind(generation_id)
        .bind(billing_state)
        .bind(actual_credits)
        .bind(credit_type)
        .bind(account_id)
        .bind(billing_error)
        .bind(charged_at_now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_account(&self, account_id: i64) -> Option<ProviderAccount> {
        sqlx::query_as::<_, ProviderAccount>("SELECT * FROM provider_accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
    }
}

/// Preference order: `web > openapi > any remaining key with balance`.
fn preferred_credit_type(account: &ProviderAccount) -> Option<String> {
    for preferred in CREDIT_TYPE_PREFERENCE {
        if account.credits.0.get(preferred).is_some_and(|balance| *balance > 0) {
            return Some(preferred.to_string());
        }
    }
    account
        .credits
        .0
        .iter()
        .find(|(_, balance)| **balance > 0)
        .map(|(credit_type, _)| credit_type.clone())
}
