//! External calendar fetching: turns a feed into the list of event instances it currently
//! publishes for a sync window. Nothing here writes to the database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::{Config, SyncConfig};
use crate::db::models::{CalendarFeed, EventKey, FeedSource, OAuthProvider};
use crate::error::{AppError, AppResult};
use crate::services::google::GoogleCalendarClient;
use crate::services::ics;
use crate::services::oauth::OAuthTokenManager;
use crate::services::resilience::ResilientClient;
use crate::services::timezone::WallClock;

// ============================================================================
// Sync window
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Upcoming events: `[now, now + days)`.
    #[default]
    Default,
    /// Past events: `[now - days, now)`.
    Historical,
}

/// Half-open UTC range `[start, end)` a sync run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub mode: SyncMode,
}

impl SyncWindow {
    /// Window for `mode` anchored at `now`. Requested lengths are capped at the
    /// historical window length.
    pub fn compute(
        mode: SyncMode,
        window_days: Option<u32>,
        config: &SyncConfig,
        now: DateTime<Utc>,
    ) -> AppResult<Self> {
        let default_days = match mode {
            SyncMode::Default => config.default_window_days,
            SyncMode::Historical => config.historical_window_days,
        };
        let days = window_days.unwrap_or(default_days);
        if days == 0 {
            return Err(AppError::Validation(
                "window_days must be at least 1".to_string(),
            ));
        }
        let days = i64::from(days.min(config.historical_window_days.max(1)));

        let (start, end) = match mode {
            SyncMode::Default => (now, now + Duration::days(days)),
            SyncMode::Historical => (now - Duration::days(days), now),
        };
        Ok(Self { start, end, mode })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

// ============================================================================
// Common event shape
// ============================================================================

/// One concrete occurrence as published by a calendar source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEventInstance {
    /// Provider-stable id of the master event.
    pub uid: String,
    /// Equals `uid` for one-off events; derived from the original start for occurrences.
    pub recurrence_id: String,
    pub start: WallClock,
    pub end: WallClock,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    /// `confirmed`, `tentative` or `cancelled`.
    pub status: String,
    pub is_all_day: bool,
}

impl ExternalEventInstance {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.uid.clone(), self.recurrence_id.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.eq_ignore_ascii_case("cancelled")
    }
}

/// Everything a source returned for one window.
#[derive(Debug, Clone, Default)]
pub struct FetchedCalendar {
    pub calendar_name: Option<String>,
    pub events: Vec<ExternalEventInstance>,
}

/// Drop cancelled and out-of-window instances and collapse duplicate keys (last wins,
/// keeping the first position).
pub fn finalize_instances(
    instances: Vec<ExternalEventInstance>,
    window: &SyncWindow,
) -> Vec<ExternalEventInstance> {
    let mut positions: HashMap<EventKey, usize> = HashMap::new();
    let mut out: Vec<ExternalEventInstance> = Vec::with_capacity(instances.len());

    for instance in instances {
        let key = instance.key();
        match positions.get(&key) {
            Some(&idx) => out[idx] = instance,
            None => {
                positions.insert(key, out.len());
                out.push(instance);
            }
        }
    }

    out.retain(|i| !i.is_cancelled() && window.contains(i.start.to_utc()));
    out
}

// ============================================================================
// Providers
// ============================================================================

/// A calendar API reached with a user's OAuth access token.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// All instances of `calendar_id` inside `window`, following pagination to the end.
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        window: &SyncWindow,
    ) -> AppResult<Vec<ExternalEventInstance>>;
}

/// Dispatches a feed to the ICS reader or the matching OAuth provider.
#[derive(Clone)]
pub struct ExternalCalendarFetcher {
    http: ResilientClient,
    oauth: OAuthTokenManager,
    providers: HashMap<OAuthProvider, Arc<dyn CalendarProvider>>,
}

impl ExternalCalendarFetcher {
    pub fn new(config: &Config) -> AppResult<Self> {
        let oauth = OAuthTokenManager::new(
            config.google.clone(),
            ResilientClient::new("Google OAuth", &config.http)?,
        );
        let google = GoogleCalendarClient::new(
            &config.google,
            ResilientClient::new("Google Calendar", &config.http)?,
        );
        Ok(Self::with_parts(
            ResilientClient::new("ICS feed", &config.http)?,
            oauth,
            Arc::new(google),
        ))
    }

    pub fn with_parts(
        http: ResilientClient,
        oauth: OAuthTokenManager,
        google: Arc<dyn CalendarProvider>,
    ) -> Self {
        let mut providers: HashMap<OAuthProvider, Arc<dyn CalendarProvider>> = HashMap::new();
        providers.insert(OAuthProvider::Google, google);
        Self {
            http,
            oauth,
            providers,
        }
    }

    /// Fetch the instances `feed` publishes inside `window`.
    ///
    /// The token refresh (if due) happens before the events call; an authorization
    /// failure from the provider is returned as an error, never as an empty calendar.
    pub async fn fetch(
        &self,
        pool: &SqlitePool,
        feed: &CalendarFeed,
        window: &SyncWindow,
    ) -> AppResult<FetchedCalendar> {
        match FeedSource::parse(&feed.source)? {
            FeedSource::Ics { url } => {
                let fetched = ics::fetch_feed(&self.http, &url, window).await?;
                tracing::debug!(
                    "Fetched {} ICS instances for feed {}",
                    fetched.events.len(),
                    feed.id
                );
                Ok(fetched)
            }
            FeedSource::OAuth {
                provider,
                calendar_id,
            } => {
                let client = self.providers.get(&provider).ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "Unsupported calendar provider '{}'",
                        provider.as_str()
                    ))
                })?;
                let token = self
                    .oauth
                    .access_token(pool, &feed.user_id, provider)
                    .await?;
                let events = client.list_events(&token, &calendar_id, window).await?;
                tracing::debug!(
                    "Fetched {} {} instances for feed {}",
                    events.len(),
                    provider.as_str(),
                    feed.id
                );
                Ok(FetchedCalendar {
                    calendar_name: None,
                    events: finalize_instances(events, window),
                })
            }
        }
    }
}
