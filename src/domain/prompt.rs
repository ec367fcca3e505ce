use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Immutable snapshot of a prompt's text, keyed by SHA-256 of its normalized
/// form. `analysis` is a best-effort, opaque document (e.g. keyword or
/// embedding analytics).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromptVersion {
    pub id: i64,
    pub text_hash: String,
    pub normalized_text: String,
    pub analysis: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Normalize prompt text for hashing: trim, collapse internal whitespace,
/// lowercase. Two prompts that differ only in casing or incidental
/// whitespace resolve to the same [`PromptVersion`].
pub fn normalize_prompt_text(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn prompt_text_hash(normalized: &str) -> String {
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_prompt_text("  A Sunlit   Meadow\n"),
            "a sunlit meadow"
        );
    }

    #[test]
    fn hash_is_stable_for_equivalent_text() {
        let a = prompt_text_hash(&normalize_prompt_text("A sunlit meadow"));
        let b = prompt_text_hash(&normalize_prompt_text("a   sunlit meadow"));
        assert_eq!(a, b);
    }
}
