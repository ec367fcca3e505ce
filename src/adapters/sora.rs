use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    AdapterError, AdapterManifest, GenerationStatusHint, ProviderAdapter, ProviderKind,
    StatusResult, Submission,
};
use crate::domain::account::ProviderAccount;
use crate::domain::generation::Generation;
use crate::domain::params::{CanonicalParams, OperationType};

const MANIFEST: AdapterManifest = AdapterManifest {
    id: "sora",
    name: "Sora",
    version: "0.1.0",
    kind: ProviderKind::Video,
    enabled: true,
    requires_credentials: true,
    domains: &["api.openai.com"],
    credit_types: &["openapi"],
};

/// OpenAI Sora adapter. A single `openapi` credit pool and a job-polling
/// shape closer to a conventional REST API than Pixverse's dashboard replay.
#[derive(Debug, Clone)]
pub struct SoraAdapter {
    client: Client,
    base_url: String,
}

impl SoraAdapter {
    pub fn new(client: Client) -> Self {
        let base_url =
            std::env::var("SORA_API_URL").unwrap_or_else(|_| "https://api.openai.com/v1/videos".to_string());
        Self { client, base_url }
    }

    fn api_key(account: &ProviderAccount) -> Result<String, AdapterError> {
        account
            .credentials
            .get("api_key")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| AdapterError::Authentication {
                provider_id: MANIFEST.id.to_string(),
            })
    }
}

#[async_trait]
impl ProviderAdapter for SoraAdapter {
    fn manifest(&self) -> &AdapterManifest {
        &MANIFEST
    }

    fn supported_operations(&self) -> BTreeSet<OperationType> {
        BTreeSet::from([OperationType::TextToVideo, OperationType::ImageToVideo])
    }

    fn map_parameters(
        &self,
        operation: OperationType,
        canonical_params: &CanonicalParams,
    ) -> Result<Value, AdapterError> {
        if !self.supported_operations().contains(&operation) {
            return Err(AdapterError::UnsupportedOperation {
                provider_id: MANIFEST.id.to_string(),
                operation,
            });
        }

        let mut payload = json!({
            "model": canonical_params
                .provider_style
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("sora-1"),
            "prompt": canonical_params.generation_config.prompt,
            "seconds": canonical_params.duration_target.unwrap_or(5.0),
        });
        if operation == OperationType::ImageToVideo {
            payload["input_reference"] = json!(canonical_params.generation_config.image_url);
        }
        Ok(payload)
    }

    async fn execute(
        &self,
        _operation: OperationType,
        account: &ProviderAccount,
        payload: Value,
    ) -> Result<Submission, AdapterError> {
        let key = Self::api_key(account)?;
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED => {
                return Err(AdapterError::Authentication {
                    provider_id: MANIFEST.id.to_string(),
                })
            }
            reqwest::StatusCode::PAYMENT_REQUIRED => {
                return Err(AdapterError::QuotaExceeded {
                    provider_id: MANIFEST.id.to_string(),
                })
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                return Err(AdapterError::RateLimit {
                    provider_id: MANIFEST.id.to_string(),
                    retry_after: None,
                })
            }
            _ => {}
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        let job_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Provider {
                message: "missing id in sora response".to_string(),
            })?
            .to_string();

        Ok(Submission {
            provider_job_id: job_id,
            initial_status: GenerationStatusHint::Processing,
            urls: vec![],
            metadata: body,
            estimated_completion: None,
        })
    }

    async fn check_status(
        &self,
        account: &ProviderAccount,
        provider_job_id: &str,
    ) -> Result<StatusResult, AdapterError> {
        let key = Self::api_key(account)?;
        let response = self
            .client
            .get(format!("{}/{provider_job_id}", self.base_url))
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AdapterError::JobNotFound {
                provider_job_id: provider_job_id.to_string(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        let status = match body.get("status").and_then(Value::as_str).unwrap_or("") {
            "completed" => GenerationStatusHint::Completed,
            "failed" => GenerationStatusHint::Failed,
            "moderation_blocked" => GenerationStatusHint::Filtered,
            "cancelled" => GenerationStatusHint::Cancelled,
            _ => GenerationStatusHint::Processing,
        };

        let urls = body
            .get("output_url")
            .and_then(Value::as_str)
            .map(|u| vec![u.to_string()])
            .unwrap_or_default();

        let error_message = if status == GenerationStatusHint::Filtered {
            Some("Content filtered (output)".to_string())
        } else {
            body.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        };

        Ok(StatusResult {
            status,
            progress: body.get("progress").and_then(Value::as_f64).map(|p| p as f32),
            urls,
            width: None,
            height: None,
            duration_secs: body.get("seconds").and_then(Value::as_f64),
            error_message,
            raw_metadata: body,
        })
    }

    async fn cancel(&self, account: &ProviderAccount, provider_job_id: &str) -> bool {
        let Ok(key) = Self::api_key(account) else {
            return false;
        };
        self.client
            .post(format!("{}/{provider_job_id}/cancel", self.base_url))
            .bearer_auth(key)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn upload_asset(
        &self,
        _account: &ProviderAccount,
        _local_path: &Path,
    ) -> Result<String, AdapterError> {
        // Sora has no cross-provider asset re-upload surface in the public API.
        Err(AdapterError::Provider {
            message: format!("{} does not support upload_asset", MANIFEST.id),
        })
    }

    fn compute_actual_credits(&self, _generation: &Generation, actual_duration: Option<f64>) -> i64 {
        let duration = actual_duration.unwrap_or(5.0).max(1.0);
        (duration.ceil() as i64) * 10
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::generation::{BillingState, GenerationStatus};
    use crate::domain::params::GenerationConfig;

    fn account(credentials: Value) -> ProviderAccount {
        ProviderAccount {
            id: 1,
            provider_id: "sora".to_string(),
            credentials,
            credits: sqlx::types::Json(Default::default()),
            current_processing_jobs: 0,
            max_concurrent: 5,
            cooldown_until: None,
            estimated_eta_secs: None,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    fn bare_generation() -> Generation {
        Generation {
            id: 1,
            user_id: 1,
            operation: OperationType::TextToVideo,
            provider_id: "sora".to_string(),
            raw_params: Value::Null,
            canonical_params: json!({}),
            inputs: json!([]),
            reproducible_hash: "hash".to_string(),
            status: GenerationStatus::Processing,
            billing_state: BillingState::Uncharged,
            retry_count: 0,
            parent_generation_id: None,
            prompt_version_id: None,
            asset_id: None,
            account_id: None,
            credit_type: None,
            actual_credits: None,
            error_message: None,
            billing_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            charged_at: None,
            updated_at: Utc::now(),
            scheduled_at: None,
        }
    }

    #[test]
    fn map_parameters_rejects_unsupported_operation() {
        let adapter = SoraAdapter::new(Client::new());
        let err = adapter
            .map_parameters(OperationType::VideoExtend, &CanonicalParams::default())
            .unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedOperation { .. }));
    }

    #[test]
    fn map_parameters_image_to_video_carries_input_reference() {
        let adapter = SoraAdapter::new(Client::new());
        let canonical = CanonicalParams {
            generation_config: GenerationConfig {
                image_url: Some("https://example.com/a.png".to_string()),
                ..Default::default()
            },
            duration_target: Some(8.0),
            ..Default::default()
        };
        let payload = adapter.map_parameters(OperationType::ImageToVideo, &canonical).unwrap();
        assert_eq!(payload["input_reference"], "https://example.com/a.png");
        assert_eq!(payload["seconds"], 8.0);
        assert_eq!(payload["model"], "sora-1");
    }

    #[test]
    fn compute_actual_credits_is_duration_scaled_and_provider_agnostic() {
        let adapter = SoraAdapter::new(Client::new());
        let generation = bare_generation();
        assert_eq!(adapter.compute_actual_credits(&generation, Some(2.1)), 30);
        assert_eq!(adapter.compute_actual_credits(&generation, None), 50);
    }

    #[tokio::test]
    async fn check_status_maps_moderation_blocked_to_filtered() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path_regex(r"^/job-9$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "moderation_blocked",
            })))
            .mount(&mock_server)
            .await;

        let adapter = SoraAdapter { client: Client::new(), base_url: mock_server.uri() };
        let account = account(json!({ "api_key": "k" }));

        let status = adapter.check_status(&account, "job-9").await.unwrap();
        assert_eq!(status.status, GenerationStatusHint::Filtered);
        assert_eq!(status.error_message.as_deref(), Some("Content filtered (output)"));
    }
}
