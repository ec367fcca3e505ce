use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    Downloading,
    Stored,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Image,
}

/// A produced artifact. `provider_uploads` caches adapter `upload_asset`
/// references so the same bytes can be reused across providers without
/// re-uploading.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Asset {
    pub id: i64,
    pub media_type: MediaType,
    pub remote_url: String,
    pub stored_key: Option<String>,
    pub sha256: Option<String>,
    pub file_size: Option<i64>,
    pub ingest_status: IngestStatus,
    pub provider_uploads: sqlx::types::Json<BTreeMap<String, String>>,
    pub media_metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// A derived/extracted asset, e.g. a provider-embedded seed image pulled
/// out during ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssetVariant {
    pub id: i64,
    pub parent_asset_id: i64,
    pub kind: String,
    pub stored_key: String,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}
