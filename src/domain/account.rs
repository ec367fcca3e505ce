use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A credential against one provider, with quota/credits.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProviderAccount {
    pub id: i64,
    pub provider_id: String,
    /// Opaque credential blob (JWT / API key / cookies); shape is
    /// adapter-specific so it's stored as JSON rather than typed columns.
    pub credentials: Value,
    /// Per-credit-type balances, e.g. `{"web": 120, "openapi": 4}`.
    pub credits: sqlx::types::Json<BTreeMap<String, i64>>,
    pub current_processing_jobs: i32,
    pub max_concurrent: i32,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Adaptive ETA estimate in seconds, refined from completed submissions.
    pub estimated_eta_secs: Option<i64>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProviderAccount {
    pub fn total_remaining_credits(&self) -> i64 {
        self.credits.0.values().sum()
    }

    pub fn has_any_balance(&self) -> bool {
        self.credits.0.values().any(|v| *v > 0)
    }

    pub fn is_in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_processing_jobs < self.max_concurrent
    }
}
