pub mod pixverse;
pub mod remaker;
pub mod registry;
pub mod sora;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::account::ProviderAccount;
use crate::domain::generation::Generation;
use crate::domain::params::{CanonicalParams, OperationType};

pub use registry::Registry;

/// Closed adapter failure taxonomy. Every provider-facing operation funnels
/// its errors through this enum so the rest of the system never has to
/// know about provider-specific wire errors.
#[derive(Debug, thiserror::Error, Clone)]
pub enum AdapterError {
    #[error("authentication failed for provider {provider_id}")]
    Authentication { provider_id: String },

    #[error("quota exceeded for provider {provider_id}")]
    QuotaExceeded { provider_id: String },

    #[error("content filtered ({stage}): {message}")]
    ContentFiltered { stage: ContentFilterStage, message: String },

    #[error("rate limited by provider {provider_id}")]
    RateLimit {
        provider_id: String,
        retry_after: Option<std::time::Duration>,
    },

    #[error("provider job not found: {provider_job_id}")]
    JobNotFound { provider_job_id: String },

    #[error("operation {operation:?} is not supported by provider {provider_id}")]
    UnsupportedOperation {
        provider_id: String,
        operation: OperationType,
    },

    #[error("provider error: {message}")]
    Provider { message: String },
}

/// Whether a content-filter rejection happened on the input (prompt) or the
/// output (generated media) side. Retry eligibility treats these
/// differently: input-side rejections are never retryable, output-side
/// ones are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFilterStage {
    Prompt,
    Output,
}

impl std::fmt::Display for ContentFilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentFilterStage::Prompt => write!(f, "prompt"),
            ContentFilterStage::Output => write!(f, "output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Video,
    Llm,
    Embedding,
    Both,
}

/// Plugin manifest. In this crate the "plugin directory" is a closed,
/// compile-time registry (`Registry::bootstrap`) rather than a dynamically
/// loaded directory, so there is no runtime monkey-patching to guard against.
#[derive(Debug, Clone)]
pub struct AdapterManifest {
    pub id: &'static str,
    pub name: &'static str,
    pub version: &'static str,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub requires_credentials: bool,
    pub domains: &'static [&'static str],
    pub credit_types: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub provider_job_id: String,
    pub initial_status: GenerationStatusHint,
    pub urls: Vec<String>,
    pub metadata: Value,
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatusHint {
    Processing,
    Completed,
    Failed,
    Filtered,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StatusResult {
    pub status: GenerationStatusHint,
    pub progress: Option<f32>,
    pub urls: Vec<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
    pub error_message: Option<String>,
    pub raw_metadata: Value,
}

/// The uniform capability surface every provider implements. Mirrors the
/// reference service's `Gateway` trait (`server/services/gateway.rs`)
/// generalized from chat completion to media generation.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn manifest(&self) -> &AdapterManifest;

    fn supported_operations(&self) -> BTreeSet<OperationType>;

    /// Pure, total-for-supported-operations translation from canonical
    /// params to a provider-specific payload.
    fn map_parameters(
        &self,
        operation: OperationType,
        canonical_params: &CanonicalParams,
    ) -> Result<Value, AdapterError>;

    async fn execute(
        &self,
        operation: OperationType,
        account: &ProviderAccount,
        payload: Value,
    ) -> Result<Submission, AdapterError>;

    async fn check_status(
        &self,
        account: &ProviderAccount,
        provider_job_id: &str,
    ) -> Result<StatusResult, AdapterError>;

    async fn cancel(&self, account: &ProviderAccount, provider_job_id: &str) -> bool;

    async fn upload_asset(
        &self,
        account: &ProviderAccount,
        local_path: &std::path::Path,
    ) -> Result<String, AdapterError>;

    fn compute_actual_credits(&self, generation: &Generation, actual_duration: Option<f64>) -> i64;
}
