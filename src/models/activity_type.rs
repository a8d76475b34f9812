use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The activity types the ledger accepts.
///
/// Each variant maps to a fixed pair of collections plus a dedup window;
/// the table is validated once at startup instead of being trusted per
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    PostOpened,
    PostRecommended,
    PostFullRead,
    PostScrolled,
    PostClickthrough,
    PostSurvey,
}

/// Per-activity-type configuration: where events land and how long repeated
/// identical events collapse into one record.
#[derive(Debug, Clone, Copy)]
pub struct ActivityTypeSpec {
    /// Table holding the per-user encrypted records.
    pub user_collection: &'static str,
    /// Table holding the anonymized cross-user aggregate.
    pub post_collection: &'static str,
    /// Metadata fields kept for this type; everything else is stripped.
    pub required_metadata: &'static [&'static str],
    /// Dedup window in milliseconds.
    pub dedup_delay_ms: i64,
}

const HALF_DAY_MS: i64 = 12 * 60 * 60 * 1000;

const AUTHOR_PERMLINK: &[&str] = &["author", "permlink"];

impl ActivityType {
    pub const ALL: [ActivityType; 6] = [
        ActivityType::PostOpened,
        ActivityType::PostRecommended,
        ActivityType::PostFullRead,
        ActivityType::PostScrolled,
        ActivityType::PostClickthrough,
        ActivityType::PostSurvey,
    ];

    pub fn spec(&self) -> ActivityTypeSpec {
        match self {
            ActivityType::PostOpened => ActivityTypeSpec {
                user_collection: "user_has_opened",
                post_collection: "post_is_opened",
                required_metadata: AUTHOR_PERMLINK,
                dedup_delay_ms: HALF_DAY_MS,
            },
            ActivityType::PostRecommended => ActivityTypeSpec {
                user_collection: "user_got_recommended",
                post_collection: "post_is_recommended",
                required_metadata: AUTHOR_PERMLINK,
                dedup_delay_ms: HALF_DAY_MS,
            },
            ActivityType::PostFullRead => ActivityTypeSpec {
                user_collection: "user_has_full_read",
                post_collection: "post_is_full_read",
                required_metadata: AUTHOR_PERMLINK,
                dedup_delay_ms: HALF_DAY_MS,
            },
            ActivityType::PostScrolled => ActivityTypeSpec {
                user_collection: "user_has_scrolled",
                post_collection: "post_is_scrolled",
                required_metadata: AUTHOR_PERMLINK,
                // Low-friction event: repeated scroll pings collapse only
                // inside a short window.
                dedup_delay_ms: 3000,
            },
            ActivityType::PostClickthrough => ActivityTypeSpec {
                user_collection: "user_has_clicked_through",
                post_collection: "post_is_clicked_through",
                required_metadata: &[
                    "origin_type",
                    "origin_author",
                    "origin_permlink",
                    "target_author",
                    "target_permlink",
                ],
                dedup_delay_ms: HALF_DAY_MS,
            },
            ActivityType::PostSurvey => ActivityTypeSpec {
                user_collection: "user_has_survey_answered",
                post_collection: "post_got_survey_answered",
                required_metadata: &["author", "permlink", "survey_answer"],
                dedup_delay_ms: HALF_DAY_MS,
            },
        }
    }

    pub fn dedup_delay(&self) -> Duration {
        Duration::milliseconds(self.spec().dedup_delay_ms)
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::PostOpened => "post_opened",
            ActivityType::PostRecommended => "post_recommended",
            ActivityType::PostFullRead => "post_full_read",
            ActivityType::PostScrolled => "post_scrolled",
            ActivityType::PostClickthrough => "post_clickthrough",
            ActivityType::PostSurvey => "post_survey",
        }
    }
}

impl Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validates the activity registry at startup: every type must name
/// distinct, non-empty collections, declare at least one metadata field,
/// and use a positive dedup window.
pub fn validate_registry() -> anyhow::Result<()> {
    let mut seen = std::collections::HashSet::new();

    for activity in ActivityType::ALL {
        let spec = activity.spec();
        anyhow::ensure!(
            !spec.user_collection.is_empty() && !spec.post_collection.is_empty(),
            "activity type {} has an empty collection name",
            activity
        );
        anyhow::ensure!(
            seen.insert(spec.user_collection) && seen.insert(spec.post_collection),
            "activity type {} reuses a collection name",
            activity
        );
        anyhow::ensure!(
            !spec.required_metadata.is_empty(),
            "activity type {} declares no metadata fields",
            activity
        );
        anyhow::ensure!(
            spec.dedup_delay_ms > 0,
            "activity type {} has a non-positive dedup delay",
            activity
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_types() {
        assert_eq!(
            ActivityType::parse("post_scrolled"),
            Some(ActivityType::PostScrolled)
        );
        assert_eq!(
            ActivityType::parse("post_clickthrough"),
            Some(ActivityType::PostClickthrough)
        );
        assert_eq!(ActivityType::parse("post_liked"), None);
    }

    #[test]
    fn test_parse_round_trips_as_str() {
        for activity in ActivityType::ALL {
            assert_eq!(ActivityType::parse(activity.as_str()), Some(activity));
        }
    }

    #[test]
    fn test_scroll_window_is_short() {
        assert_eq!(ActivityType::PostScrolled.spec().dedup_delay_ms, 3000);
        assert_eq!(ActivityType::PostOpened.spec().dedup_delay_ms, HALF_DAY_MS);
    }

    #[test]
    fn test_registry_is_valid() {
        validate_registry().unwrap();
    }
}
