//! ICS feed reading: download, parse VEVENTs, expand recurrences.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use icalendar::{
    parser::{read_calendar, unfold, Component, Property},
    CalendarDateTime, DatePerhapsTime,
};

use crate::error::{AppError, AppResult};
use crate::services::fetcher::{
    finalize_instances, ExternalEventInstance, FetchedCalendar, SyncWindow,
};
use crate::services::recurrence::{self, ExceptionDate, RecurringEvent};
use crate::services::resilience::ResilientClient;
use crate::services::timezone::{to_utc, WallClock};

/// Download `url` and return its instances inside `window`.
pub async fn fetch_feed(
    http: &ResilientClient,
    url: &str,
    window: &SyncWindow,
) -> AppResult<FetchedCalendar> {
    let response = http
        .send(|client| {
            client
                .get(url)
                .header(reqwest::header::ACCEPT, "text/calendar, text/plain, */*")
        })
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::Upstream(format!(
            "ICS feed returned {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        )));
    }

    let content = response.text().await?;
    parse_calendar(&content, window)
}

/// Parse ICS text into the instances that start inside `window`.
///
/// Masters are expanded first and `RECURRENCE-ID` overrides applied after them, so an
/// override replaces the occurrence it names. Cancelled instances are dropped.
pub fn parse_calendar(content: &str, window: &SyncWindow) -> AppResult<FetchedCalendar> {
    let unfolded = unfold(content);
    let calendar = read_calendar(&unfolded)
        .map_err(|e| AppError::Upstream(format!("Invalid ICS feed: {}", e)))?;

    let mut vevents = Vec::new();
    collect_vevents(&calendar.components, &mut vevents);

    let mut masters = Vec::new();
    let mut overrides = Vec::new();
    for vevent in vevents {
        match parse_vevent(vevent) {
            Some(ParsedVEvent::Master(master)) => masters.push(master),
            Some(ParsedVEvent::Override(instance)) => overrides.push(instance),
            None => {}
        }
    }

    let mut instances: Vec<ExternalEventInstance> = masters
        .iter()
        .flat_map(|master| recurrence::expand(master, window))
        .collect();
    instances.extend(overrides);

    Ok(FetchedCalendar {
        calendar_name: calendar_name(&unfolded),
        events: finalize_instances(instances, window),
    })
}

fn collect_vevents<'c, 'a>(components: &'c [Component<'a>], out: &mut Vec<&'c Component<'a>>) {
    for component in components {
        if component.name == "VEVENT" {
            out.push(component);
        } else {
            collect_vevents(&component.components, out);
        }
    }
}

/// `X-WR-CALNAME` of the calendar, if set.
fn calendar_name(unfolded: &str) -> Option<String> {
    unfolded
        .lines()
        .find(|line| {
            let upper = line.to_ascii_uppercase();
            upper.starts_with("X-WR-CALNAME:") || upper.starts_with("X-WR-CALNAME;")
        })
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| unescape_text(value.trim()))
        .filter(|name| !name.is_empty())
}

enum ParsedVEvent {
    Master(RecurringEvent),
    Override(ExternalEventInstance),
}

fn parse_vevent(vevent: &Component<'_>) -> Option<ParsedVEvent> {
    let Some(uid) = vevent
        .find_prop("UID")
        .map(|p| p.val.to_string())
        .filter(|uid| !uid.trim().is_empty())
    else {
        tracing::warn!("Skipping VEVENT without UID");
        return None;
    };

    let Some((start, is_all_day)) = vevent.find_prop("DTSTART").and_then(wall_clock) else {
        tracing::warn!("Skipping VEVENT {} without a readable DTSTART", uid);
        return None;
    };

    let end = vevent
        .find_prop("DTEND")
        .and_then(wall_clock)
        .map(|(end, _)| end)
        .or_else(|| {
            vevent
                .find_prop("DURATION")
                .and_then(|p| parse_duration(p.val.as_ref()))
                .map(|d| start.shifted(d))
        })
        .unwrap_or_else(|| {
            if is_all_day {
                start.shifted(Duration::days(1))
            } else {
                start.clone()
            }
        });

    let text = |name: &str| {
        vevent
            .find_prop(name)
            .map(|p| unescape_text(p.val.as_ref()))
            .filter(|s| !s.trim().is_empty())
    };

    let status = match vevent.find_prop("STATUS").map(|p| p.val.as_ref().to_ascii_uppercase()) {
        Some(s) if s == "CANCELLED" => "cancelled",
        Some(s) if s == "TENTATIVE" => "tentative",
        _ => "confirmed",
    };

    let mut instance = ExternalEventInstance {
        uid: uid.clone(),
        recurrence_id: uid,
        start,
        end,
        title: text("SUMMARY").unwrap_or_else(|| "(No title)".to_string()),
        description: text("DESCRIPTION"),
        location: text("LOCATION"),
        status: status.to_string(),
        is_all_day,
    };

    if let Some((original, original_all_day)) =
        vevent.find_prop("RECURRENCE-ID").and_then(wall_clock)
    {
        instance.recurrence_id = original.occurrence_key(original_all_day);
        return Some(ParsedVEvent::Override(instance));
    }

    let rrule = vevent.find_prop("RRULE").map(|p| p.val.to_string());
    let master_tzid = instance.start.tzid.clone();
    let exdates = vevent
        .properties
        .iter()
        .filter(|p| p.name == "EXDATE")
        .flat_map(|p| exception_dates(p, master_tzid.as_deref()))
        .collect();

    Some(ParsedVEvent::Master(RecurringEvent {
        template: instance,
        rrule,
        exdates,
    }))
}

/// A date or date-time property as a wall clock, plus whether it was a bare date.
fn wall_clock(prop: &Property<'_>) -> Option<(WallClock, bool)> {
    match DatePerhapsTime::try_from(prop).ok()? {
        DatePerhapsTime::Date(d) => Some((WallClock::floating(d.and_time(NaiveTime::MIN)), true)),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => Some((WallClock::utc(dt), false)),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => {
            Some((WallClock::floating(naive), false))
        }
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            Some((WallClock::new(date_time, Some(tzid)), false))
        }
    }
}

/// Parse one EXDATE property (possibly comma-separated) relative to the master's zone.
fn exception_dates(prop: &Property<'_>, master_tzid: Option<&str>) -> Vec<ExceptionDate> {
    let tzid = prop
        .params
        .iter()
        .find(|p| p.key == "TZID")
        .and_then(|p| p.val.as_ref().map(|v| v.to_string()));
    let is_date = prop
        .params
        .iter()
        .any(|p| p.key == "VALUE" && p.val.as_ref().map(|v| v.as_ref()) == Some("DATE"));

    prop.val
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            if is_date || s.len() == 8 {
                return NaiveDate::parse_from_str(s, "%Y%m%d")
                    .ok()
                    .map(ExceptionDate::Date);
            }
            if let Some(utc) = s.strip_suffix('Z') {
                return NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
                    .ok()
                    .map(|n| ExceptionDate::Instant(n.and_utc()));
            }
            let naive = NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S").ok()?;
            match tzid.as_deref() {
                Some(tz) if Some(tz) != master_tzid => {
                    Some(ExceptionDate::Instant(to_utc(naive, Some(tz))))
                }
                _ => Some(ExceptionDate::Local(naive)),
            }
        })
        .collect()
}

/// RFC 5545 `DURATION` (`P1W`, `P1DT2H`, `-PT15M`, ...).
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, rest) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let rest = rest.strip_prefix('P')?;

    let mut total = Duration::zero();
    let mut number = String::new();
    let mut in_time = false;
    for c in rest.chars() {
        match c {
            '0'..='9' => number.push(c),
            'T' => in_time = true,
            unit => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                total += match (unit, in_time) {
                    ('W', false) => Duration::weeks(n),
                    ('D', false) => Duration::days(n),
                    ('H', true) => Duration::hours(n),
                    ('M', true) => Duration::minutes(n),
                    ('S', true) => Duration::seconds(n),
                    _ => return None,
                };
            }
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(if negative { -total } else { total })
}

/// Undo RFC 5545 TEXT escaping.
fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
