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
    id: "remaker",
    name: "Remaker.ai",
    version: "0.1.0",
    kind: ProviderKind::Video,
    enabled: true,
    requires_credentials: true,
    domains: &["remaker.ai"],
    credit_types: &["web"],
};

/// Remaker.ai image inpainting adapter. Grounded on
/// `original_source/.../providers/remaker/manifest.py`: a single `web`
/// credit pool and cookie-session replay rather than a bearer token.
#[derive(Debug, Clone)]
pub struct RemakerAdapter {
    client: Client,
    base_url: String,
}

impl RemakerAdapter {
    pub fn new(client: Client) -> Self {
        let base_url =
            std::env::var("REMAKER_API_URL").unwrap_or_else(|_| "https://api.remaker.ai/api/v1".to_string());
        Self { client, base_url }
    }

    fn cookie_header(account: &ProviderAccount) -> Result<String, AdapterError> {
        account
            .credentials
            .get("cookies")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| AdapterError::Authentication {
                provider_id: MANIFEST.id.to_string(),
            })
    }
}

#[async_trait]
impl ProviderAdapter for RemakerAdapter {
    fn manifest(&self) -> &AdapterManifest {
        &MANIFEST
    }

    fn supported_operations(&self) -> BTreeSet<OperationType> {
        BTreeSet::from([OperationType::ImageToImage, OperationType::Fusion])
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

        let image_urls = canonical_params
            .generation_config
            .image_urls
            .clone()
            .or_else(|| canonical_params.generation_config.image_url.clone().map(|u| vec![u]))
            .unwrap_or_default();

        Ok(json!({
            "prompt": canonical_params.generation_config.prompt,
            "images": image_urls,
        }))
    }

    async fn execute(
        &self,
        _operation: OperationType,
        account: &ProviderAccount,
        payload: Value,
    ) -> Result<Submission, AdapterError> {
        let cookies = Self::cookie_header(account)?;
        let response = self
            .client
            .post(format!("{}/inpaint", self.base_url))
            .header("Cookie", cookies)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AdapterError::Authentication {
                provider_id: MANIFEST.id.to_string(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        let job_id = body
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Provider {
                message: "missing task_id in remaker response".to_string(),
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
        let cookies = Self::cookie_header(account)?;
        let response = self
            .client
            .get(format!("{}/inpaint/{provider_job_id}", self.base_url))
            .header("Cookie", cookies)
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

        let status = match body.get("state").and_then(Value::as_str).unwrap_or("") {
            "done" => GenerationStatusHint::Completed,
            "error" => GenerationStatusHint::Failed,
            "rejected" => GenerationStatusHint::Filtered,
            _ => GenerationStatusHint::Processing,
        };

        let urls = body
            .get("result_url")
            .and_then(Value::as_str)
            .map(|u| vec![u.to_string()])
            .unwrap_or_default();

        let error_message = if status == GenerationStatusHint::Filtered {
            Some("Content filtered (output)".to_string())
        } else {
            body.get("message").and_then(Value::as_str).map(|s| s.to_string())
        };

        Ok(StatusResult {
            status,
            progress: None,
            urls,
            width: body.get("width").and_then(Value::as_u64).map(|v| v as u32),
            height: body.get("height").and_then(Value::as_u64).map(|v| v as u32),
            duration_secs: None,
            error_message,
            raw_metadata: body,
        })
    }

    async fn cancel(&self, _account: &ProviderAccount, _provider_job_id: &str) -> bool {
        // Remaker's internal web API has no cancel endpoint; best-effort is a no-op.
        false
    }

    async fn upload_asset(
        &self,
        account: &ProviderAccount,
        local_path: &Path,
    ) -> Result<String, AdapterError> {
        let cookies = Self::cookie_header(account)?;
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name("asset.bin");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .header("Cookie", cookies)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Provider { message: e.to_string() })?;

        body.get("file_id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| AdapterError::Provider {
                message: "missing file_id in remaker upload response".to_string(),
            })
    }

    fn compute_actual_credits(&self, _generation: &Generation, _actual_duration: Option<f64>) -> i64 {
        // Remaker bills a flat per-inpaint cost, independent of duration.
        2
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::generation::{BillingState, GenerationStatus};
    use crate::domain::params::GenerationConfig;

    fn account(credentials: Value) -> ProviderAccount {
        ProviderAccount {
            id: 1,
            provider_id: "remaker".to_string(),
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
            operation: OperationType::ImageToImage,
            provider_id: "remaker".to_string(),
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
        let adapter = RemakerAdapter::new(Client::new());
        let err = adapter
            .map_parameters(OperationType::TextToVideo, &CanonicalParams::default())
            .unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedOperation { .. }));
    }

    #[test]
    fn map_parameters_falls_back_to_single_image_url() {
        let adapter = RemakerAdapter::new(Client::new());
        let canonical = CanonicalParams {
            generation_config: GenerationConfig {
                image_url: Some("https://example.com/a.png".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let payload = adapter.map_parameters(OperationType::ImageToImage, &canonical).unwrap();
        assert_eq!(payload["images"], json!(["https://example.com/a.png"]));
    }

    #[test]
    fn compute_actual_credits_is_a_flat_rate() {
        let adapter = RemakerAdapter::new(Client::new());
        let generation = bare_generation();
        assert_eq!(adapter.compute_actual_credits(&generation, Some(30.0)), 2);
        assert_eq!(adapter.compute_actual_credits(&generation, None), 2);
    }

    #[tokio::test]
    async fn execute_requires_cookie_credentials() {
        let mock_server = MockServer::start().await;
        let adapter = RemakerAdapter { client: Client::new(), base_url: mock_server.uri() };
        let account = account(json!({}));

        let err = adapter
            .execute(OperationType::ImageToImage, &account, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Authentication { .. }));
    }

    #[tokio::test]
    async fn execute_submits_and_returns_task_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/inpaint"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task_id": "t-1" })))
            .mount(&mock_server)
            .await;

        let adapter = RemakerAdapter { client: Client::new(), base_url: mock_server.uri() };
        let account = account(json!({ "cookies": "session=abc" }));

        let submission = adapter
            .execute(OperationType::ImageToImage, &account, json!({ "prompt": "merge" }))
            .await
            .unwrap();
        assert_eq!(submission.provider_job_id, "t-1");
    }
}
