use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::rating::ContentRating;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    TextToVideo,
    ImageToVideo,
    ImageToImage,
    VideoExtend,
    VideoTransition,
    Fusion,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::TextToVideo => "text_to_video",
            OperationType::ImageToVideo => "image_to_video",
            OperationType::ImageToImage => "image_to_image",
            OperationType::VideoExtend => "video_extend",
            OperationType::VideoTransition => "video_transition",
            OperationType::Fusion => "fusion",
        }
    }
}

/// A single scene reference (`scene_context.from_scene` / `.to_scene`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SceneRef {
    pub id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `scene_context` section of the structured create-request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SceneContext {
    #[serde(default)]
    pub from_scene: Option<SceneRef>,
    #[serde(default)]
    pub to_scene: Option<SceneRef>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `player_context` section: carried forward verbatim into canonical params.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayerContext {
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// `social_context` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SocialContext {
    #[serde(rename = "contentRating")]
    pub content_rating: Option<String>,
    #[serde(rename = "_ratingClamped", default)]
    pub rating_clamped: bool,
    #[serde(rename = "_originalRating", default)]
    pub original_rating: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `generation_config` section: the provider-agnostic request body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationConfig {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompts: Option<Vec<String>>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_urls: Option<Vec<String>>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub original_video_id: Option<String>,
    #[serde(default)]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub constraints: Option<Constraints>,
    #[serde(default)]
    pub style: Option<Style>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Duration {
    pub target: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Constraints {
    pub rating: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Style {
    pub pacing: Option<String>,
    /// Keyed by provider id: `style.<provider_id>.*`.
    #[serde(flatten)]
    pub per_provider: BTreeMap<String, Value>,
}

/// The structured create-request envelope, exactly as accepted over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateRequestParams {
    #[serde(default)]
    pub generation_config: GenerationConfig,
    #[serde(default)]
    pub scene_context: SceneContext,
    #[serde(default)]
    pub player_context: PlayerContext,
    #[serde(default)]
    pub social_context: SocialContext,
}

/// The top-level section names of the structured create-request envelope.
pub const STRUCTURED_PARAMS_SECTIONS: &[&str] =
    &["generation_config", "scene_context", "player_context", "social_context"];

/// Whether `raw` carries at least one of the structured envelope's top-level
/// sections. Legacy flat payloads (a bare `prompt`/`image_url` etc. at the
/// top level of `params`, or no `params` at all) have none, and must be
/// rejected rather than silently deserialized into an all-empty
/// [`CreateRequestParams`].
pub fn is_structured_params(raw: &Value) -> bool {
    match raw.as_object() {
        Some(obj) => STRUCTURED_PARAMS_SECTIONS.iter().any(|key| obj.contains_key(*key)),
        None => false,
    }
}

/// The flattened, provider-agnostic + adapter-lifted parameter record
/// produced by canonicalization. Field order is irrelevant; hashing goes
/// through `json_canonical`, which sorts keys.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CanonicalParams {
    pub operation: String,
    pub provider_id: String,
    #[serde(default)]
    pub duration_target: Option<f64>,
    #[serde(default)]
    pub constraint_rating: Option<String>,
    #[serde(default)]
    pub style_pacing: Option<String>,
    #[serde(default)]
    pub provider_style: BTreeMap<String, Value>,
    #[serde(default)]
    pub scene_context: SceneContext,
    #[serde(default)]
    pub player_context: PlayerContext,
    #[serde(default)]
    pub social_context: SocialContext,
    #[serde(default)]
    pub generation_config: GenerationConfig,
}

/// Ordered references to seed scenes/assets derived from `scene_context`.
pub type Inputs = Vec<String>;

/// Serialize a value with sorted object keys at every level, so that
/// semantically-identical params always produce byte-identical JSON
/// regardless of field insertion order. This is what makes
/// `reproducible_hash` actually reproducible.
pub fn json_canonical(value: &Value) -> String {
    serde_json::to_string(&sort_keys(value)).expect("canonical JSON values always serialize")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect();
            serde_json::to_value(sorted).expect("BTreeMap<String, Value> always serializes")
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// `reproducible_hash`: SHA-256 over `(canonical_params, inputs)`.
pub fn reproducible_hash(canonical_params: &CanonicalParams, inputs: &Inputs) -> String {
    let envelope = serde_json::json!({
        "canonical_params": canonical_params,
        "inputs": inputs,
    });
    let canonical = json_canonical(&envelope);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_under_field_reordering() {
        let mut a = CanonicalParams {
            operation: "text_to_video".into(),
            provider_id: "pixverse".into(),
            ..Default::default()
        };
        a.provider_style.insert("model".into(), Value::String("v2".into()));
        a.provider_style.insert("seed".into(), Value::from(7));

        let mut b = a.clone();
        // BTreeMap already sorts insertion, but re-derive via JSON roundtrip
        // with keys in a different order to prove sort_keys does the work.
        let raw = serde_json::json!({"seed": 7, "model": "v2"});
        b.provider_style = serde_json::from_value(raw).unwrap();

        assert_eq!(
            reproducible_hash(&a, &vec![]),
            reproducible_hash(&b, &vec![])
        );
    }

    #[test]
    fn hash_changes_with_inputs() {
        let params = CanonicalParams {
            operation: "text_to_video".into(),
            provider_id: "pixverse".into(),
            ..Default::default()
        };
        let h1 = reproducible_hash(&params, &vec!["scene-1".to_string()]);
        let h2 = reproducible_hash(&params, &vec!["scene-2".to_string()]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn content_rating_round_trips_in_social_context() {
        let ctx = SocialContext {
            content_rating: Some("romantic".into()),
            rating_clamped: true,
            original_rating: Some("restricted".into()),
            extra: BTreeMap::new(),
        };
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["contentRating"], "romantic");
        assert_eq!(value["_ratingClamped"], true);
        let _ = ContentRating::Sfw; // keep import used across module
    }

    #[test]
    fn is_structured_params_accepts_any_known_section() {
        assert!(is_structured_params(&serde_json::json!({
            "generation_config": { "prompt": "a cat" }
        })));
        assert!(is_structured_params(&serde_json::json!({
            "social_context": { "contentRating": "sfw" }
        })));
    }

    #[test]
    fn is_structured_params_rejects_legacy_flat_payloads() {
        assert!(!is_structured_params(&serde_json::json!({
            "prompt": "a cat",
            "image_url": "https://example.com/a.png"
        })));
        assert!(!is_structured_params(&Value::Null));
        assert!(!is_structured_params(&serde_json::json!([])));
        assert!(!is_structured_params(&serde_json::json!({})));
    }
}
