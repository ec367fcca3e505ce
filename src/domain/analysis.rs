use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::generation::GenerationStatus;

/// A narrower sibling of [`super::generation::Generation`]: the status
/// poller advances these on the same cadence but with a shorter default
/// timeout.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Analysis {
    pub id: i64,
    pub status: GenerationStatus,
    pub account_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

pub const ANALYSIS_DEFAULT_TIMEOUT_SECS: i64 = 30 * 60;
