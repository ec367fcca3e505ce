use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One attempt to dispatch a [`super::generation::Generation`] to a
/// provider. Append-only; the latest row by `submitted_at` for a given
/// generation is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProviderSubmission {
    pub id: i64,
    pub generation_id: i64,
    pub account_id: i64,
    pub provider_job_id: String,
    pub submitted_at: DateTime<Utc>,
    pub response: Value,
    pub status: String,
    pub estimated_completion: Option<DateTime<Utc>>,
}
