use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

// ============================================================================
// Calendar Feed Models
// ============================================================================

/// Whether every event in a feed is in-domain, or the feed needs rule-based filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncApproach {
    YogaOnly,
    MixedCalendar,
}

impl SyncApproach {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncApproach::YogaOnly => "yoga_only",
            SyncApproach::MixedCalendar => "mixed_calendar",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "yoga_only" => Some(SyncApproach::YogaOnly),
            "mixed_calendar" => Some(SyncApproach::MixedCalendar),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarFeed {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    /// Encoded provider discriminator, see [`FeedSource::parse`].
    pub source: String,
    pub sync_approach: SyncApproach,
    pub filtering_enabled: bool,
    pub last_synced_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthProvider {
    Google,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
        }
    }
}

/// Where a feed's events come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    Ics {
        url: String,
    },
    OAuth {
        provider: OAuthProvider,
        calendar_id: String,
    },
}

impl FeedSource {
    /// Decode the `source` column of a feed.
    ///
    /// - `http://`, `https://` and `webcal://` URLs are ICS feeds (`webcal` is fetched over https).
    /// - `google:<calendar id>` / `google://<calendar id>` is a Google Calendar behind OAuth.
    ///   The calendar id may be percent-encoded.
    pub fn parse(source: &str) -> AppResult<Self> {
        let source = source.trim();

        if let Some(rest) = source
            .strip_prefix("google://")
            .or_else(|| source.strip_prefix("google:"))
        {
            let calendar_id = urlencoding::decode(rest)
                .map_err(|_| {
                    AppError::BadRequest(format!("Malformed Google calendar id: {}", rest))
                })?
                .trim()
                .to_string();
            if calendar_id.is_empty() {
                return Err(AppError::BadRequest(
                    "Google feed is missing a calendar id".to_string(),
                ));
            }
            return Ok(FeedSource::OAuth {
                provider: OAuthProvider::Google,
                calendar_id,
            });
        }

        let lower = source.to_ascii_lowercase();
        let url = if lower.starts_with("webcal://") {
            format!("https://{}", &source["webcal://".len()..])
        } else if lower.starts_with("webcals://") {
            format!("https://{}", &source["webcals://".len()..])
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            source.to_string()
        } else {
            return Err(AppError::BadRequest(format!(
                "Unsupported calendar provider for feed source '{}'",
                source
            )));
        };

        url::Url::parse(&url)
            .map_err(|e| AppError::BadRequest(format!("Invalid ICS feed URL: {}", e)))?;

        Ok(FeedSource::Ics { url })
    }

    /// Short discriminator reported back to sync callers.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedSource::Ics { .. } => "ics",
            FeedSource::OAuth { .. } => "oauth",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_google_sources_with_encoded_ids() {
        let source = FeedSource::parse("google:team%40group.calendar.google.com").unwrap();
        assert_eq!(
            source,
            FeedSource::OAuth {
                provider: OAuthProvider::Google,
                calendar_id: "team@group.calendar.google.com".to_string(),
            }
        );
        assert_eq!(source.kind(), "oauth");

        let primary = FeedSource::parse("google://primary").unwrap();
        assert!(matches!(primary, FeedSource::OAuth { ref calendar_id, .. } if calendar_id == "primary"));
    }

    #[test]
    fn webcal_is_fetched_over_https() {
        let source = FeedSource::parse("webcal://calendar.example.com/classes.ics").unwrap();
        assert_eq!(
            source,
            FeedSource::Ics {
                url: "https://calendar.example.com/classes.ics".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_providers() {
        assert!(matches!(
            FeedSource::parse("outlook:abc"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            FeedSource::parse("google:"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn sync_approach_round_trips_through_its_column_value() {
        for approach in [SyncApproach::YogaOnly, SyncApproach::MixedCalendar] {
            assert_eq!(SyncApproach::parse(approach.as_str()), Some(approach));
        }
        assert_eq!(SyncApproach::parse("everything"), None);
    }
}
