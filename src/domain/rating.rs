use std::fmt;

/// Canonical content rating scale, least to most permissive.
pub const RATING_ORDER: [&str; 4] = ["sfw", "romantic", "mature_implied", "restricted"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentRating {
    Sfw,
    Romantic,
    MatureImplied,
    Restricted,
}

impl ContentRating {
    pub fn index(self) -> usize {
        match self {
            ContentRating::Sfw => 0,
            ContentRating::Romantic => 1,
            ContentRating::MatureImplied => 2,
            ContentRating::Restricted => 3,
        }
    }

    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => ContentRating::Sfw,
            1 => ContentRating::Romantic,
            2 => ContentRating::MatureImplied,
            _ => ContentRating::Restricted,
        }
    }

    pub fn as_str(self) -> &'static str {
        RATING_ORDER[self.index()]
    }
}

impl fmt::Display for ContentRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized content rating: {0}")]
pub struct UnknownRatingError(pub String);

impl std::str::FromStr for ContentRating {
    type Err = UnknownRatingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RATING_ORDER
            .iter()
            .position(|candidate| *candidate == value)
            .map(ContentRating::from_index)
            .ok_or_else(|| UnknownRatingError(value.to_string()))
    }
}

/// Clamp `requested` to the most restrictive of `world_max` and `user_max`.
///
/// Returns the clamped rating plus whether clamping actually changed the value.
pub fn clamp_rating(
    requested: ContentRating,
    world_max: ContentRating,
    user_max: ContentRating,
) -> (ContentRating, bool) {
    let effective_max = world_max.min(user_max);
    if requested > effective_max {
        (effective_max, true)
    } else {
        (requested, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_known_ratings() {
        assert_eq!(ContentRating::from_str("romantic").unwrap(), ContentRating::Romantic);
    }

    #[test]
    fn rejects_unknown_ratings() {
        assert!(ContentRating::from_str("explicit").is_err());
    }

    #[test]
    fn clamp_takes_most_restrictive() {
        let (clamped, changed) = clamp_rating(
            ContentRating::Restricted,
            ContentRating::Romantic,
            ContentRating::MatureImplied,
        );
        assert_eq!(clamped, ContentRating::Romantic);
        assert!(changed);
    }

    #[test]
    fn clamp_is_noop_when_within_bounds() {
        let (clamped, changed) = clamp_rating(
            ContentRating::Sfw,
            ContentRating::Restricted,
            ContentRating::Restricted,
        );
        assert_eq!(clamped, ContentRating::Sfw);
        assert!(!changed);
    }

    #[test]
    fn ordering_matches_permissiveness() {
        assert!(ContentRating::Sfw < ContentRating::Romantic);
        assert!(ContentRating::Romantic < ContentRating::MatureImplied);
        assert!(ContentRating::MatureImplied < ContentRating::Restricted);
    }
}
