use std::fmt;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Redis-backed cache & dedup layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

const DAY_SECS: i64 = 24 * 60 * 60;

/// Per-request caching policy, orthogonal to dedup. `Always` disables the
/// cache key path entirely (every request is treated as distinct).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    Once,
    PerPlaythrough,
    PerPlayer,
    Always,
}

impl CacheStrategy {
    pub fn ttl_seconds(self) -> Option<i64> {
        match self {
            CacheStrategy::Once => Some(365 * DAY_SECS),
            CacheStrategy::PerPlaythrough => Some(90 * DAY_SECS),
            CacheStrategy::PerPlayer => Some(180 * DAY_SECS),
            CacheStrategy::Always => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            CacheStrategy::Once => "once",
            CacheStrategy::PerPlaythrough => "per_playthrough",
            CacheStrategy::PerPlayer => "per_player",
            CacheStrategy::Always => "always",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that identify a cache key beyond the strategy/seed.
/// `from_scene_id`/`to_scene_id` default to `"none"` so omitted and
/// explicit-none scene references hash identically.
pub struct CacheKeyParts<'a> {
    pub operation: &'a str,
    pub purpose: &'a str,
    pub from_scene_id: Option<&'a str>,
    pub to_scene_id: Option<&'a str>,
    pub strategy: CacheStrategy,
    pub playthrough_id: Option<&'a str>,
    pub user_id: i64,
    pub version: u32,
}

/// Build the pipe-delimited cache key, or `None` if the strategy is
/// `Always` (caching disabled for this request).
pub fn compute_cache_key(parts: &CacheKeyParts<'_>) -> Option<String> {
    if parts.strategy == CacheStrategy::Always {
        return None;
    }
    let from_scene = parts.from_scene_id.unwrap_or("none");
    let to_scene = parts.to_scene_id.unwrap_or("none");
    let seed = match parts.strategy {
        CacheStrategy::Once => String::new(),
        CacheStrategy::PerPlaythrough => {
            format!("pt:{}", parts.playthrough_id.unwrap_or("none"))
        }
        CacheStrategy::PerPlayer => format!("player:{}", parts.user_id),
        CacheStrategy::Always => unreachable!(),
    };
    let version = parts.version.max(1);
    Some(format!(
        "generation:{}|{}|{}|{}|{}|{}|v{}",
        parts.operation, parts.purpose, from_scene, to_scene, parts.strategy, seed, version
    ))
}

pub fn dedup_key(reproducible_hash: &str) -> String {
    format!("generation:hash:{reproducible_hash}")
}

fn stampede_lock_key(cache_key: &str) -> String {
    format!("{cache_key}:lock")
}

#[derive(Clone)]
pub struct CacheService {
    conn: ConnectionManager,
}

impl CacheService {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Dedup lookup by reproducible hash. TTL 90 days.
    pub async fn get_dedup(&self, reproducible_hash: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(dedup_key(reproducible_hash)).await?)
    }

    pub async fn set_dedup(&self, reproducible_hash: &str, generation_id: i64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(dedup_key(reproducible_hash), generation_id, 90 * DAY_SECS as u64)
            .await?;
        Ok(())
    }

    pub async fn invalidate_dedup(&self, reproducible_hash: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(dedup_key(reproducible_hash)).await?;
        Ok(())
    }

    /// Strategy-aware cache lookup.
    pub async fn get_cache(&self, cache_key: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn.clone();
        let hit: Option<i64> = conn.get(cache_key).await?;
        if hit.is_some() {
            self.incr_stat("cache_hits_24h").await?;
        } else {
            self.incr_stat("cache_misses_24h").await?;
        }
        Ok(hit)
    }

    pub async fn set_cache(
        &self,
        cache_key: &str,
        generation_id: i64,
        strategy: CacheStrategy,
    ) -> Result<(), CacheError> {
        let Some(ttl) = strategy.ttl_seconds() else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(cache_key, generation_id, ttl as u64).await?;
        self.incr_stat("total_cached").await?;
        Ok(())
    }

    pub async fn invalidate_cache(&self, cache_key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(cache_key).await?;
        Ok(())
    }

    /// Best-effort stampede lock, `SET NX EX 30`. Returns `true` if this
    /// caller won the lock and is responsible for the fill.
    pub async fn acquire_stampede_lock(&self, cache_key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(stampede_lock_key(cache_key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(30)
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        Ok(acquired)
    }

    pub async fn release_stampede_lock(&self, cache_key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(stampede_lock_key(cache_key)).await?;
        Ok(())
    }

    async fn incr_stat(&self, name: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.incr::<_, _, ()>(format!("generation:stats:{name}"), 1).await?;
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<CacheStats, CacheError> {
        let mut conn = self.conn.clone();
        let hits: i64 = conn.get::<_, Option<i64>>("generation:stats:cache_hits_24h").await?.unwrap_or(0);
        let misses: i64 = conn.get::<_, Option<i64>>("generation:stats:cache_misses_24h").await?.unwrap_or(0);
        let total_cached: i64 = conn.get::<_, Option<i64>>("generation:stats:total_cached").await?.unwrap_or(0);
        Ok(CacheStats { hits, misses, total_cached })
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub hits: i64,
    pub misses: i64,
    pub total_cached: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_none_placeholder_for_missing_scenes() {
        let parts = CacheKeyParts {
            operation: "text_to_video",
            purpose: "scene_intro",
            from_scene_id: None,
            to_scene_id: None,
            strategy: CacheStrategy::Once,
            playthrough_id: None,
            user_id: 7,
            version: 1,
        };
        assert_eq!(
            compute_cache_key(&parts).unwrap(),
            "generation:text_to_video|scene_intro|none|none||v1"
        );
    }

    #[test]
    fn per_playthrough_embeds_playthrough_seed() {
        let parts = CacheKeyParts {
            operation: "image_to_video",
            purpose: "reaction",
            from_scene_id: Some("s1"),
            to_scene_id: Some("s2"),
            strategy: CacheStrategy::PerPlaythrough,
            playthrough_id: Some("pt-42"),
            user_id: 7,
            version: 2,
        };
        assert_eq!(
            compute_cache_key(&parts).unwrap(),
            "generation:image_to_video|reaction|s1|s2|per_playthrough|pt:pt-42|v2"
        );
    }

    #[test]
    fn always_strategy_disables_caching() {
        let parts = CacheKeyParts {
            operation: "text_to_video",
            purpose: "x",
            from_scene_id: None,
            to_scene_id: None,
            strategy: CacheStrategy::Always,
            playthrough_id: None,
            user_id: 1,
            version: 1,
        };
        assert!(compute_cache_key(&parts).is_none());
    }
}
