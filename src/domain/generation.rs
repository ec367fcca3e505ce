use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::params::OperationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum GenerationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GenerationStatus::Completed | GenerationStatus::Failed | GenerationStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Pending => "PENDING",
            GenerationStatus::Processing => "PROCESSING",
            GenerationStatus::Completed => "COMPLETED",
            GenerationStatus::Failed => "FAILED",
            GenerationStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum BillingState {
    Uncharged,
    Charged,
    Skipped,
    Failed,
}

/// A guarded state transition attempt on a [`Generation`]. Terminal states
/// are absorbing: any caller that tries to move a generation out of a
/// terminal status (other than the retry controller's explicit
/// `FAILED -> PENDING` reuse path) gets this error back instead of
/// silently clobbering state.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("generation {id} is in terminal state {from:?}, cannot transition to {to:?}")]
    NotMonotonic {
        id: i64,
        from: GenerationStatus,
        to: GenerationStatus,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Generation {
    pub id: i64,
    pub user_id: i64,
    pub operation: OperationType,
    pub provider_id: String,
    pub raw_params: Value,
    pub canonical_params: Value,
    pub inputs: Value,
    pub reproducible_hash: String,
    pub status: GenerationStatus,
    pub billing_state: BillingState,
    pub retry_count: i32,
    pub parent_generation_id: Option<i64>,
    pub prompt_version_id: Option<i64>,
    pub asset_id: Option<i64>,
    pub account_id: Option<i64>,
    pub credit_type: Option<String>,
    pub actual_credits: Option<i64>,
    pub error_message: Option<String>,
    pub billing_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub charged_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Generation {
    /// Guard a state transition per this type's state machine. `force_reuse`
    /// is set only by the retry controller's `FAILED -> PENDING` path, the
    /// single documented exception to "terminal states are absorbing".
    pub fn guard_transition(
        &self,
        to: GenerationStatus,
        force_reuse: bool,
    ) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            let is_retry_reuse =
                force_reuse && self.status == GenerationStatus::Failed && to == GenerationStatus::Pending;
            if !is_retry_reuse {
                return Err(TransitionError::NotMonotonic {
                    id: self.id,
                    from: self.status,
                    to,
                });
            }
        }
        Ok(())
    }
}
