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
    id: "pixverse",
    name: "Pixverse",
    version: "0.1.0",
    kind: ProviderKind::Video,
    enabled: true,
    requires_credentials: true,
    domains: &["app-api.pixverse.ai"],
    credit_types: &["web", "openapi"],
};

/// Pixverse video generation adapter. Grounded on
/// `original_source/.../services/provider/adapters/pixverse_credits.py`:
/// two independent credit pools (`web`, `openapi`), 8s timeouts on
/// credit-status calls, and a dashboard-style job submission/poll API.
#[derive(Debug, Clone)]
pub struct PixverseAdapter {
    client: Client,
    base_url: String,
}

impl PixverseAdapter {
    pub fn new(client: Client) -> Self {
        let base_url = std::env::var("PIXVERSE_API_URL")
            .unwrap_or_else(|_| "https://app-api.pixverse.ai/creative_platform/video".to_string());
        Self { client, base_url }
    }

    /// Test/ops hook for pointing at a mock or self-hosted endpoint instead
    /// of the provider's real API.
    pub fn with_base_url(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    fn auth_header(account: &ProviderAccount) -> Result<String, AdapterError> {
        account
            .credentials
            .get("jwt_token")
            .and_then(Value::as_str)
            .map(|token| format!("Bearer {token}"))
            .ok_or_else(|| AdapterError::Authentication {
                provider_id: MANIFEST.id.to_string(),
            })
    }
}

#[async_trait]
impl ProviderAdapter for PixverseAdapter {
    fn manifest(&self) -> &AdapterManifest {
        &MANIFEST
    }

    fn supported_operations(&self) -> BTreeSet<OperationType> {
        BTreeSet::from([
            OperationType::TextToVideo,
            OperationType::ImageToVideo,
            OperationType::VideoExtend,
        ])
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

        let model = canonical_params
            .provider_style
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("v2");
        let quality = canonical_params
            .provider_style
            .get("quality")
            .and_then(Value::as_str)
            .unwrap_or("standard");

        let mut payload = json!({
            "model": model,
            "quality": quality,
            "duration": canonical_params.duration_target.unwrap_or(5.0),
            "prompt": canonical_params.generation_config.prompt,
        });

        match operation {
            OperationType::ImageToVideo => {
                payload["image_url"] = json!(canonical_params.generation_config.image_url);
            }
            OperationType::VideoExtend => {
                payload["video_url"] = json!(canonical_params.generation_config.video_url);
                payload["original_video_id"] =
                    json!(canonical_params.generation_config.original_video_id);
            }
            _ => {}
        }

        Ok(payload)
    }

    async fn execute(
        &self,
        _operation: OperationType,
        account: &ProviderAccount,
        payload: Value,
    ) -> Result<Submission, AdapterError> {
        let auth = Self::auth_header(account)?;
        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .header("Authorization", auth)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AdapterError::Authentication {
                provider_id: MANIFEST.id.to_string(),
            });
        }
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::RateLimit {
                provider_id: MANIFEST.id.to_string(),
                retry_after: None,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        let job_id = body
            .get("video_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Provider {
                message: "missing video_id in pixverse response".to_string(),
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
        let auth = Self::auth_header(account)?;
        let response = self
            .client
            .get(format!("{}/{provider_job_id}", self.base_url))
            .header("Authorization", auth)
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

        let status_code = body.get("status").and_then(Value::as_str).unwrap_or("");
        let status = match status_code {
            "success" => GenerationStatusHint::Completed,
            "failed" => GenerationStatusHint::Failed,
            "content_filtered" => GenerationStatusHint::Filtered,
            "cancelled" => GenerationStatusHint::Cancelled,
            _ => GenerationStatusHint::Processing,
        };
        let error_message = if status == GenerationStatusHint::Filtered {
            Some("Content filtered (output)".to_string())
        } else {
            body.get("error").and_then(Value::as_str).map(|s| s.to_string())
        };

        let urls = body
            .get("url")
            .and_then(Value::as_str)
            .map(|u| vec![u.to_string()])
            .unwrap_or_default();

        Ok(StatusResult {
            status,
            progress: body.get("progress").and_then(Value::as_f64).map(|p| p as f32),
            urls,
            width: body.get("width").and_then(Value::as_u64).map(|v| v as u32),
            height: body.get("height").and_then(Value::as_u64).map(|v| v as u32),
            duration_secs: body.get("duration").and_then(Value::as_f64),
            error_message,
            raw_metadata: body,
        })
    }

    async fn cancel(&self, account: &ProviderAccount, provider_job_id: &str) -> bool {
        let Ok(auth) = Self::auth_header(account) else {
            return false;
        };
        self.client
            .post(format!("{}/{provider_job_id}/cancel", self.base_url))
            .header("Authorization", auth)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn upload_asset(
        &self,
        account: &ProviderAccount,
        local_path: &Path,
    ) -> Result<String, AdapterError> {
        let auth = Self::auth_header(account)?;
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name("asset.bin");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .header("Authorization", auth)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        body.get("asset_id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| AdapterError::Provider {
                message: "missing asset_id in pixverse upload response".to_string(),
            })
    }

    fn compute_actual_credits(&self, generation: &Generation, actual_duration: Option<f64>) -> i64 {
        let duration = actual_duration.unwrap_or(5.0).max(1.0);
        let quality = generation
            .canonical_params
            .get("provider_style")
            .and_then(|s| s.get("quality"))
            .and_then(Value::as_str)
            .unwrap_or("standard");
        let per_second = match quality {
            "high" | "1080p" => 12,
            "standard" | "720p" => 6,
            _ => 6,
        };
        (duration.ceil() as i64) * per_second
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::generation::{BillingState, GenerationStatus};
    use crate::domain::params::{CanonicalParams, GenerationConfig};

    fn account(credentials: Value) -> ProviderAccount {
        ProviderAccount {
            id: 1,
            provider_id: "pixverse".to_string(),
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

    fn generation_with_quality(quality: &str) -> Generation {
        Generation {
            id: 1,
            user_id: 1,
            operation: OperationType::TextToVideo,
            provider_id: "pixverse".to_string(),
            raw_params: Value::Null,
            canonical_params: json!({ "provider_style": { "quality": quality } }),
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
        let adapter = PixverseAdapter::new(Client::new());
        let err = adapter
            .map_parameters(OperationType::Fusion, &CanonicalParams::default())
            .unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedOperation { .. }));
    }

    #[test]
    fn map_parameters_defaults_model_and_quality() {
        let adapter = PixverseAdapter::new(Client::new());
        let canonical = CanonicalParams {
            generation_config: GenerationConfig {
                prompt: Some("a cat".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let payload = adapter.map_parameters(OperationType::TextToVideo, &canonical).unwrap();
        assert_eq!(payload["model"], "v2");
        assert_eq!(payload["quality"], "standard");
        assert_eq!(payload["prompt"], "a cat");
    }

    #[test]
    fn map_parameters_image_to_video_carries_image_url() {
        let adapter = PixverseAdapter::new(Client::new());
        let canonical = CanonicalParams {
            generation_config: GenerationConfig {
                image_url: Some("https://example.com/a.png".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let payload = adapter.map_parameters(OperationType::ImageToVideo, &canonical).unwrap();
        assert_eq!(payload["image_url"], "https://example.com/a.png");
    }

    #[test]
    fn compute_actual_credits_scales_with_quality_and_duration() {
        let adapter = PixverseAdapter::new(Client::new());
        let standard = generation_with_quality("standard");
        let high = generation_with_quality("high");
        assert_eq!(adapter.compute_actual_credits(&standard, Some(3.2)), 24);
        assert_eq!(adapter.compute_actual_credits(&high, Some(3.2)), 48);
        assert_eq!(adapter.compute_actual_credits(&standard, None), 30);
    }

    #[tokio::test]
    async fn execute_submits_and_returns_provider_job_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "video_id": "job-123",
                "status": "processing",
            })))
            .mount(&mock_server)
            .await;

        let adapter = PixverseAdapter::with_base_url(Client::new(), mock_server.uri());
        let account = account(json!({ "jwt_token": "t" }));

        let submission = adapter
            .execute(OperationType::TextToVideo, &account, json!({ "prompt": "a cat" }))
            .await
            .unwrap();

        assert_eq!(submission.provider_job_id, "job-123");
        assert_eq!(submission.initial_status, GenerationStatusHint::Processing);
    }

    #[tokio::test]
    async fn execute_without_credentials_fails_before_any_request() {
        let mock_server = MockServer::start().await;
        let adapter = PixverseAdapter::with_base_url(Client::new(), mock_server.uri());
        let account = account(json!({}));

        let err = adapter
            .execute(OperationType::TextToVideo, &account, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Authentication { .. }));
    }

    #[tokio::test]
    async fn check_status_maps_completed_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path_regex(r"^/job-123$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "url": "https://cdn.pixverse.ai/out.mp4",
                "duration": 5.0,
            })))
            .mount(&mock_server)
            .await;

        let adapter = PixverseAdapter::with_base_url(Client::new(), mock_server.uri());
        let account = account(json!({ "jwt_token": "t" }));

        let status = adapter.check_status(&account, "job-123").await.unwrap();
        assert_eq!(status.status, GenerationStatusHint::Completed);
        assert_eq!(status.urls, vec!["https://cdn.pixverse.ai/out.mp4".to_string()]);
    }

    #[tokio::test]
    async fn check_status_maps_not_found_to_job_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path_regex(r"^/missing$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let adapter = PixverseAdapter::with_base_url(Client::new(), mock_server.uri());
        let account = account(json!({ "jwt_token": "t" }));

        let err = adapter.check_status(&account, "missing").await.unwrap_err();
        assert!(matches!(err, AdapterError::JobNotFound { .. }));
    }
}
