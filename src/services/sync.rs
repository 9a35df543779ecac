use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::models::{format_utc, CalendarFeed, FeedSource, SyncFilterRule, UpsertEvent};
use crate::db::{EventRepository, FeedRepository, RuleRepository};
use crate::error::AppResult;
use crate::services::fetcher::{ExternalEventInstance, SyncMode, SyncWindow};
use crate::services::filter::FilterPolicy;
use crate::services::matching::{event_content, Matcher};
use crate::services::reconcile::{self, ReconcileOutcome};
use crate::AppState;

lazy_static::lazy_static! {
    // One lock per feed id so overlapping syncs of the same feed never interleave.
    static ref FEED_LOCKS: Mutex<HashMap<String, Arc<Mutex<()>>>> = Mutex::new(HashMap::new());
}

async fn feed_lock(feed_id: &str) -> Arc<Mutex<()>> {
    FEED_LOCKS
        .lock()
        .await
        .entry(feed_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Drop the feed's lock entry once no sync holds or waits on it.
async fn release_feed_lock(feed_id: &str, lock: Arc<Mutex<()>>) {
    drop(lock);
    let mut locks = FEED_LOCKS.lock().await;
    if locks
        .get(feed_id)
        .is_some_and(|entry| Arc::strong_count(entry) == 1)
    {
        locks.remove(feed_id);
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SyncOptions {
    #[serde(default)]
    pub mode: SyncMode,
    pub window_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub feed_id: String,
    /// `ics` or `oauth`.
    pub source_kind: &'static str,
    pub calendar_name: Option<String>,
    /// Events the feed has in the window after the sync.
    pub count: usize,
    pub outcome: ReconcileOutcome,
}

/// Calendar sync manager:
///
/// - Fetches the feed's events for the requested window (ICS or OAuth provider).
/// - Applies the feed's import filter, then tags and studios from the user's rules.
/// - Reconciles against the stored events of the same feed and window: stale rows are
///   deleted, new and changed rows upserted, the feed stamped, all in one transaction.
pub struct CalendarSyncManager;

impl CalendarSyncManager {
    /// Synchronize every feed in default mode. Failures are logged per feed.
    pub async fn sync_all(state: &AppState) -> AppResult<()> {
        let feeds = FeedRepository::list_all(&state.db).await?;
        info!("Starting calendar synchronization for {} feeds", feeds.len());

        for feed in feeds {
            match Self::sync_feed(state, &feed, SyncOptions::default()).await {
                Ok(report) => info!(
                    "Synced feed {}: {} events ({} inserted, {} updated, {} deleted)",
                    feed.id,
                    report.count,
                    report.outcome.inserted,
                    report.outcome.updated,
                    report.outcome.deleted
                ),
                Err(e) => warn!("Failed to sync feed {}: {:?}", feed.id, e),
            }
        }

        Ok(())
    }

    pub async fn sync_feed(
        state: &AppState,
        feed: &CalendarFeed,
        options: SyncOptions,
    ) -> AppResult<SyncReport> {
        let source = FeedSource::parse(&feed.source)?;
        let window = SyncWindow::compute(
            options.mode,
            options.window_days,
            &state.config.sync,
            Utc::now(),
        )?;

        let lock = feed_lock(&feed.id).await;
        let result = {
            let _guard = lock.lock().await;
            Self::sync_locked(state, feed, &source, window).await
        };
        release_feed_lock(&feed.id, lock).await;
        result
    }

    async fn sync_locked(
        state: &AppState,
        feed: &CalendarFeed,
        source: &FeedSource,
        window: SyncWindow,
    ) -> AppResult<SyncReport> {
        info!(
            "Syncing feed {} ({}, {:?} mode, {} .. {})",
            feed.id,
            source.kind(),
            window.mode,
            window.start,
            window.end
        );

        let fetched = state.fetcher.fetch(&state.db, feed, &window).await?;
        let fetched_count = fetched.events.len();

        let filter_rules = async {
            if FilterPolicy::needs_rules(feed) {
                RuleRepository::active_filter_rules(&state.db, &feed.user_id, &feed.id).await
            } else {
                Ok(Vec::<SyncFilterRule>::new())
            }
        };
        let (filter_rules, tag_rules, tag_slugs, studios) = tokio::try_join!(
            filter_rules,
            RuleRepository::list_tag_rules(&state.db, &feed.user_id),
            RuleRepository::tag_slugs(&state.db, &feed.user_id),
            RuleRepository::list_studio_patterns(&state.db, &feed.user_id),
        )?;

        let policy = FilterPolicy::for_feed(feed, &filter_rules);
        let kept = policy.apply(fetched.events);
        if kept.len() < fetched_count {
            info!(
                "Filter kept {} of {} events for feed {}",
                kept.len(),
                fetched_count,
                feed.id
            );
        }

        let matcher = Matcher::new(tag_rules, tag_slugs, studios);
        let fresh: Vec<UpsertEvent> = kept
            .into_iter()
            .map(|event| enrich(feed, &matcher, window.mode, event))
            .collect();

        let stored = EventRepository::find_in_window(
            &state.db,
            &feed.user_id,
            &feed.id,
            &format_utc(window.start),
            &format_utc(window.end),
        )
        .await?;

        let plan = reconcile::plan(fresh, &stored);
        let outcome = reconcile::apply(&state.db, &feed.id, plan, Utc::now().naive_utc()).await?;

        info!(
            "Feed {} synced: {} inserted, {} updated, {} unchanged, {} deleted",
            feed.id, outcome.inserted, outcome.updated, outcome.unchanged, outcome.deleted
        );

        Ok(SyncReport {
            feed_id: feed.id.clone(),
            source_kind: source.kind(),
            calendar_name: fetched.calendar_name,
            count: outcome.total(),
            outcome,
        })
    }
}

/// Turn a fetched instance into the row written for it.
fn enrich(
    feed: &CalendarFeed,
    matcher: &Matcher,
    mode: SyncMode,
    event: ExternalEventInstance,
) -> UpsertEvent {
    let content = event_content(&event.title, event.description.as_deref());
    let tags = matcher.match_tags(&content, event.location.as_deref());
    let studio_id = matcher.match_studio(event.location.as_deref());

    UpsertEvent {
        user_id: feed.user_id.clone(),
        feed_id: feed.id.clone(),
        start_time: format_utc(event.start.to_utc()),
        end_time: format_utc(event.end.to_utc()),
        uid: event.uid,
        recurrence_id: event.recurrence_id,
        title: event.title,
        location: event.location,
        description: event.description,
        tags,
        studio_id,
        status: event.status,
        initial_student_count: match mode {
            SyncMode::Historical => Some(0),
            SyncMode::Default => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::test_support::*;
    use crate::error::AppError;
    use crate::services::fetcher::ExternalCalendarFetcher;
    use chrono::{Duration, NaiveDate};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ics_day(date: NaiveDate) -> String {
        date.format("%Y%m%d").to_string()
    }

    /// Daily class for five days starting tomorrow, plus an unrelated appointment.
    fn upcoming_feed() -> String {
        let tomorrow = Utc::now().date_naive() + Duration::days(1);
        format!(
            "BEGIN:VCALENDAR\r\n\
             VERSION:2.0\r\n\
             X-WR-CALNAME:Studio Schedule\r\n\
             BEGIN:VEVENT\r\n\
             UID:flow@studio\r\n\
             DTSTART:{day}T090000Z\r\n\
             DTEND:{day}T100000Z\r\n\
             RRULE:FREQ=DAILY;COUNT=5\r\n\
             SUMMARY:Vinyasa Flow\r\n\
             LOCATION:Studio A\\, Main St\r\n\
             END:VEVENT\r\n\
             BEGIN:VEVENT\r\n\
             UID:dentist@personal\r\n\
             DTSTART:{day}T150000Z\r\n\
             DTEND:{day}T160000Z\r\n\
             SUMMARY:Dentist\r\n\
             END:VEVENT\r\n\
             END:VCALENDAR\r\n",
            day = ics_day(tomorrow)
        )
    }

    async fn state_with_feed(
        server: &MockServer,
        approach: &str,
        filtering: bool,
    ) -> (AppState, CalendarFeed) {
        let pool = memory_pool().await;
        let source = format!("{}/studio.ics", server.uri());
        insert_feed(&pool, "f1", "u1", &source, approach, filtering).await;
        insert_tag(&pool, "t-vinyasa", "u1", "vinyasa").await;
        insert_tag_rule(&pool, "r1", "u1", "t-vinyasa", None, &["vinyasa"], &[]).await;
        insert_billing_entity(&pool, "studio-a", "u1", "studio", &["studio a"], "2024-01-01 00:00:00").await;

        let mut config = Config::default();
        config.http.max_retries = 0;
        let fetcher = ExternalCalendarFetcher::new(&config).unwrap();
        let feed = FeedRepository::find_by_id(&pool, "f1").await.unwrap().unwrap();
        (
            AppState {
                db: pool,
                config,
                fetcher,
            },
            feed,
        )
    }

    async fn serve(server: &MockServer, body: String) {
        Mock::given(method("GET"))
            .and(path("/studio.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn sync_stores_enriched_events_and_is_idempotent() {
        let server = MockServer::start().await;
        serve(&server, upcoming_feed()).await;
        let (state, feed) = state_with_feed(&server, "yoga_only", false).await;

        let first = CalendarSyncManager::sync_feed(&state, &feed, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(first.source_kind, "ics");
        assert_eq!(first.calendar_name.as_deref(), Some("Studio Schedule"));
        assert_eq!(first.count, 6);
        assert_eq!(first.outcome.inserted, 6);

        let rows = EventRepository::find_for_rematch(&state.db, "u1", Some("f1"), None)
            .await
            .unwrap();
        let flow = rows.iter().find(|r| r.uid == "flow@studio").unwrap();
        assert_eq!(flow.tags, vec!["vinyasa".to_string()]);
        assert_eq!(flow.studio_id.as_deref(), Some("studio-a"));
        assert_eq!(flow.students_studio, None);

        let second = CalendarSyncManager::sync_feed(&state, &feed, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(
            second.outcome,
            ReconcileOutcome {
                inserted: 0,
                updated: 0,
                unchanged: 6,
                deleted: 0
            }
        );

        let synced = FeedRepository::find_by_id(&state.db, "f1").await.unwrap().unwrap();
        assert!(synced.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn mixed_calendar_without_rules_imports_nothing() {
        let server = MockServer::start().await;
        serve(&server, upcoming_feed()).await;
        let (state, feed) = state_with_feed(&server, "mixed_calendar", true).await;

        let report = CalendarSyncManager::sync_feed(&state, &feed, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.count, 0);
        assert_eq!(EventRepository::count_for_feed(&state.db, "f1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mixed_calendar_keeps_events_matching_a_rule() {
        let server = MockServer::start().await;
        serve(&server, upcoming_feed()).await;
        let (state, feed) = state_with_feed(&server, "mixed_calendar", true).await;
        insert_filter_rule(&state.db, "fr1", "u1", "f1", "title", "contains", "flow", true).await;

        let report = CalendarSyncManager::sync_feed(&state, &feed, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.count, 5);
    }

    #[tokio::test]
    async fn historical_sync_starts_student_counts_at_zero() {
        let server = MockServer::start().await;
        let last_week = Utc::now().date_naive() - Duration::days(7);
        serve(
            &server,
            format!(
                "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:past@studio\r\n\
                 DTSTART:{day}T090000Z\r\nDTEND:{day}T100000Z\r\nSUMMARY:Yin\r\n\
                 END:VEVENT\r\nEND:VCALENDAR\r\n",
                day = ics_day(last_week)
            ),
        )
        .await;
        let (state, feed) = state_with_feed(&server, "yoga_only", false).await;

        let options = SyncOptions {
            mode: SyncMode::Historical,
            window_days: Some(30),
        };
        let report = CalendarSyncManager::sync_feed(&state, &feed, options).await.unwrap();
        assert_eq!(report.count, 1);

        let row = &EventRepository::find_for_rematch(&state.db, "u1", None, None)
            .await
            .unwrap()[0];
        assert_eq!(row.students_studio, Some(0));
        assert_eq!(row.students_online, Some(0));
    }

    /// A `google:primary` feed whose stored token has already expired, with the token
    /// endpoint and the Calendar API both served by `server`.
    async fn google_state(server: &MockServer, feed_id: &str) -> (AppState, CalendarFeed) {
        let pool = memory_pool().await;
        insert_feed(&pool, feed_id, "u1", "google:primary", "yoga_only", false).await;
        insert_tag(&pool, "t-vinyasa", "u1", "vinyasa").await;
        insert_tag_rule(&pool, "r1", "u1", "t-vinyasa", None, &["vinyasa"], &[]).await;
        let expired = Utc::now().naive_utc() - Duration::minutes(10);
        insert_oauth_integration(&pool, "i1", "u1", "stale-access", Some("refresh-1"), expired).await;

        let mut config = Config::default();
        config.google.client_id = Some("client".into());
        config.google.client_secret = Some("secret".into());
        config.google.token_url = format!("{}/token", server.uri());
        config.google.calendar_api_url = server.uri();
        config.http.max_retries = 0;
        let fetcher = ExternalCalendarFetcher::new(&config).unwrap();
        let feed = FeedRepository::find_by_id(&pool, feed_id).await.unwrap().unwrap();
        (
            AppState {
                db: pool,
                config,
                fetcher,
            },
            feed,
        )
    }

    #[tokio::test]
    async fn google_feed_refreshes_the_token_then_stores_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh-access",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let day = (Utc::now().date_naive() + Duration::days(2))
            .format("%Y-%m-%d")
            .to_string();
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(header("authorization", "Bearer fresh-access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {
                        "id": "flow_1",
                        "recurringEventId": "flow",
                        "summary": "Vinyasa Flow",
                        "start": { "dateTime": format!("{day}T15:00:00+01:00"), "timeZone": "America/New_York" },
                        "end": { "dateTime": format!("{day}T16:00:00+01:00"), "timeZone": "America/New_York" }
                    },
                    {
                        "id": "call",
                        "summary": "Accountant call",
                        "start": { "dateTime": format!("{day}T18:00:00Z") },
                        "end": { "dateTime": format!("{day}T18:30:00Z") }
                    },
                    {
                        "id": "dropped",
                        "status": "cancelled",
                        "start": { "dateTime": format!("{day}T20:00:00Z") }
                    }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (state, feed) = google_state(&server, "g-ok").await;
        let report = CalendarSyncManager::sync_feed(&state, &feed, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(report.source_kind, "oauth");
        assert_eq!(report.count, 2);
        assert_eq!(report.outcome.inserted, 2);

        let rows = EventRepository::find_for_rematch(&state.db, "u1", Some("g-ok"), None)
            .await
            .unwrap();
        let flow = rows.iter().find(|r| r.uid == "flow").unwrap();
        assert_eq!(flow.start_time, format!("{day}T14:00:00Z"));
        assert_eq!(flow.tags, vec!["vinyasa".to_string()]);

        let synced = FeedRepository::find_by_id(&state.db, "g-ok").await.unwrap().unwrap();
        assert!(synced.last_synced_at.is_some());
        assert!(!FEED_LOCKS.lock().await.contains_key("g-ok"));
    }

    #[tokio::test]
    async fn failed_refresh_and_rejected_token_fail_the_sync() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendars/primary/events"))
            .and(header("authorization", "Bearer stale-access"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid Credentials"))
            .expect(1)
            .mount(&server)
            .await;

        let (state, feed) = google_state(&server, "g-denied").await;
        let err = CalendarSyncManager::sync_feed(&state, &feed, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Upstream(msg) if msg.contains("authorization")));

        assert_eq!(EventRepository::count_for_feed(&state.db, "g-denied").await.unwrap(), 0);
        let untouched = FeedRepository::find_by_id(&state.db, "g-denied").await.unwrap().unwrap();
        assert!(untouched.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn upstream_failure_writes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let (state, feed) = state_with_feed(&server, "yoga_only", false).await;

        assert!(CalendarSyncManager::sync_feed(&state, &feed, SyncOptions::default())
            .await
            .is_err());
        let untouched = FeedRepository::find_by_id(&state.db, "f1").await.unwrap().unwrap();
        assert!(untouched.last_synced_at.is_none());
    }
}
