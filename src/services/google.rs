//! Google Calendar events-list client.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::GoogleConfig;
use crate::error::{AppError, AppResult};
use crate::services::fetcher::{CalendarProvider, ExternalEventInstance, SyncWindow};
use crate::services::resilience::ResilientClient;
use crate::services::timezone::{to_wall_clock, WallClock};

#[derive(Clone)]
pub struct GoogleCalendarClient {
    http: ResilientClient,
    api_url: String,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventsResponse {
    #[serde(default)]
    items: Vec<GoogleCalendarEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCalendarEvent {
    id: String,
    status: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    start: Option<EventDateTime>,
    end: Option<EventDateTime>,
    recurring_event_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventDateTime {
    date: Option<String>,
    date_time: Option<String>,
    time_zone: Option<String>,
}

impl EventDateTime {
    /// The raw value as sent, used in instance identities.
    fn raw(&self) -> Option<&str> {
        self.date_time.as_deref().or(self.date.as_deref())
    }

    /// Wall clock plus whether this is an all-day date.
    ///
    /// The offset on `dateTime` is the calendar's, not necessarily the event's, so the
    /// value is read as an instant and re-expressed in `timeZone`. Instants the zone
    /// cannot name unambiguously (the repeated fall-back hour) stay in UTC.
    fn wall_clock(&self) -> Option<(WallClock, bool)> {
        if let Some(dt) = self.date_time.as_deref() {
            let instant = DateTime::parse_from_rfc3339(dt).ok()?.with_timezone(&Utc);
            let wall = match self.time_zone.as_deref().filter(|tz| !tz.is_empty()) {
                Some(tz) => {
                    let local = WallClock::new(to_wall_clock(instant, Some(tz)), Some(tz.to_string()));
                    if local.to_utc() == instant {
                        local
                    } else {
                        WallClock::utc(instant)
                    }
                }
                None => WallClock::utc(instant),
            };
            return Some((wall, false));
        }
        let date = NaiveDate::parse_from_str(self.date.as_deref()?, "%Y-%m-%d").ok()?;
        Some((WallClock::floating(date.and_time(NaiveTime::MIN)), true))
    }
}

impl GoogleCalendarClient {
    pub fn new(config: &GoogleConfig, http: ResilientClient) -> Self {
        Self {
            http,
            api_url: config.calendar_api_url.trim_end_matches('/').to_string(),
            page_size: config.events_page_size.clamp(1, 2500),
        }
    }

    async fn fetch_page(
        &self,
        access_token: &str,
        calendar_id: &str,
        window: &SyncWindow,
        page_token: Option<&str>,
    ) -> AppResult<GoogleEventsResponse> {
        let url = format!(
            "{}/calendars/{}/events",
            self.api_url,
            urlencoding::encode(calendar_id)
        );
        let mut query: Vec<(&str, String)> = vec![
            ("timeMin", window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("timeMax", window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
            ("maxResults", self.page_size.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response = self
            .http
            .send(|client| client.get(&url).bearer_auth(access_token).query(&query))
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "Google Calendar authorization error ({}): {}",
                status, body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "Google Calendar API error ({}): {}",
                status, body
            )));
        }

        response
            .json::<GoogleEventsResponse>()
            .await
            .map_err(|e| AppError::Upstream(format!("Failed to parse Google response: {}", e)))
    }
}

/// Map one item, skipping cancelled items and items without usable times.
fn to_instance(event: GoogleCalendarEvent) -> Option<ExternalEventInstance> {
    let status = event
        .status
        .as_deref()
        .unwrap_or("confirmed")
        .to_ascii_lowercase();
    if status == "cancelled" {
        return None;
    }

    let start = event.start.as_ref()?;
    let Some((start_wall, is_all_day)) = start.wall_clock() else {
        tracing::warn!("Skipping Google event {} with unreadable start", event.id);
        return None;
    };
    let end_wall = event
        .end
        .as_ref()
        .and_then(|e| e.wall_clock())
        .map(|(end, _)| end)
        .unwrap_or_else(|| start_wall.clone());

    let uid = event
        .recurring_event_id
        .clone()
        .unwrap_or_else(|| event.id.clone());
    let recurrence_id = format!("{}_{}", uid, start.raw().unwrap_or_default());

    Some(ExternalEventInstance {
        uid,
        recurrence_id,
        start: start_wall,
        end: end_wall,
        title: event
            .summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "(No title)".to_string()),
        description: event.description.filter(|s| !s.trim().is_empty()),
        location: event.location.filter(|s| !s.trim().is_empty()),
        status,
        is_all_day,
    })
}

#[async_trait]
impl CalendarProvider for GoogleCalendarClient {
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        window: &SyncWindow,
    ) -> AppResult<Vec<ExternalEventInstance>> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .fetch_page(access_token, calendar_id, window, page_token.as_deref())
                .await?;
            pages += 1;
            tracing::debug!(
                "Fetched Google Calendar page {} ({} items) for {}",
                pages,
                page.items.len(),
                calendar_id
            );
            events.extend(page.items.into_iter().filter_map(to_instance));

            match page.next_page_token {
                Some(next) if !next.is_empty() && page_token.as_deref() != Some(next.as_str()) => {
                    page_token = Some(next);
                }
                _ => break,
            }
        }

        Ok(events)
    }
}
