//! RRULE expansion for recurring masters.
//!
//! Occurrences are generated in wall-clock space: the master's local start is handed to
//! the rrule crate as if it were UTC, so BYDAY/BYHOUR parts keep their local meaning across
//! DST changes. Each occurrence is converted to a real instant only when the window is
//! applied.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use rrule::RRuleSet;

use crate::services::fetcher::{ExternalEventInstance, SyncWindow};
use crate::services::timezone::{to_utc, to_wall_clock, WallClock};

/// Upper bound on generated occurrences per master.
pub const MAX_OCCURRENCES: u16 = 1000;

/// An EXDATE value in the form it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionDate {
    /// `VALUE=DATE`; removes every occurrence on that day.
    Date(NaiveDate),
    /// Floating, or in the master's own zone; matches the occurrence's local start.
    Local(NaiveDateTime),
    /// UTC, or a zone other than the master's; matches the occurrence's instant.
    Instant(DateTime<Utc>),
}

/// A master VEVENT: the template instance plus its recurrence description.
#[derive(Debug, Clone)]
pub struct RecurringEvent {
    pub template: ExternalEventInstance,
    pub rrule: Option<String>,
    pub exdates: Vec<ExceptionDate>,
}

/// Expand a master into concrete instances.
///
/// Without an RRULE the template is returned as-is. With one, every occurrence starting
/// inside `window` is returned with its `recurrence_id` set from the original local start.
/// A rule the rrule crate rejects degrades to the template alone.
pub fn expand(event: &RecurringEvent, window: &SyncWindow) -> Vec<ExternalEventInstance> {
    let Some(rule) = event
        .rrule
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
    else {
        return vec![event.template.clone()];
    };

    match expand_rule(event, rule, window) {
        Ok(instances) => instances,
        Err(e) => {
            tracing::warn!(
                "Malformed RRULE '{}' on event {}: {}; importing the master only",
                rule,
                event.template.uid,
                e
            );
            vec![event.template.clone()]
        }
    }
}

fn expand_rule(
    event: &RecurringEvent,
    rule: &str,
    window: &SyncWindow,
) -> Result<Vec<ExternalEventInstance>, String> {
    let template = &event.template;
    let tzid = template.start.tzid.as_deref();

    let rrule_str = format!(
        "DTSTART:{}Z\nRRULE:{}",
        template.start.naive.format("%Y%m%dT%H%M%S"),
        wall_clock_rule(rule, tzid)
    );
    let set = rrule_str
        .parse::<RRuleSet>()
        .map_err(|e| e.to_string())?;

    // Local times sit within a day of their instant, so a day of slack on both sides
    // covers every zone; after/before are exclusive.
    let tz: rrule::Tz = Utc.into();
    let after = (window.start - Duration::days(1) - Duration::seconds(1)).with_timezone(&tz);
    let before = (window.end + Duration::days(1) + Duration::seconds(1)).with_timezone(&tz);
    let result = set.after(after).before(before).all(MAX_OCCURRENCES);

    if result.limited {
        tracing::warn!(
            "Recurrence of event {} truncated at {} occurrences",
            template.uid,
            MAX_OCCURRENCES
        );
    }

    let duration = template.end.naive - template.start.naive;

    Ok(result
        .dates
        .iter()
        .map(|dt| dt.naive_utc())
        .filter(|wall| !is_excluded(*wall, template, &event.exdates))
        .filter_map(|wall| {
            let start = WallClock::new(wall, template.start.tzid.clone());
            if !window.contains(start.to_utc()) {
                return None;
            }
            let end = start.shifted(duration);
            Some(ExternalEventInstance {
                recurrence_id: start.occurrence_key(template.is_all_day),
                start,
                end,
                ..template.clone()
            })
        })
        .collect())
}

fn is_excluded(
    wall: NaiveDateTime,
    template: &ExternalEventInstance,
    exdates: &[ExceptionDate],
) -> bool {
    let all_day = template.is_all_day;
    exdates.iter().any(|ex| match ex {
        ExceptionDate::Date(d) => wall.date() == *d,
        ExceptionDate::Local(n) if all_day => n.date() == wall.date(),
        ExceptionDate::Local(n) => *n == wall,
        ExceptionDate::Instant(i) if all_day => i.date_naive() == wall.date(),
        ExceptionDate::Instant(i) => to_utc(wall, template.start.tzid.as_deref()) == *i,
    })
}

/// Rewrite `UNTIL` into the same wall-clock space as DTSTART.
fn wall_clock_rule(rule: &str, tzid: Option<&str>) -> String {
    let rule = rule.strip_prefix("RRULE:").unwrap_or(rule);
    rule.split(';')
        .filter(|part| !part.trim().is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) if key.trim().eq_ignore_ascii_case("UNTIL") => {
                format!("UNTIL={}", wall_clock_until(value.trim(), tzid))
            }
            _ => part.trim().to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn wall_clock_until(value: &str, tzid: Option<&str>) -> String {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
        return format!("{}T235959Z", date.format("%Y%m%d"));
    }
    if let Some(utc) = value.strip_suffix('Z') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S") {
            let wall = to_wall_clock(naive.and_utc(), tzid);
            return format!("{}Z", wall.format("%Y%m%dT%H%M%S"));
        }
    }
    if NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").is_ok() {
        return format!("{}Z", value);
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fetcher::SyncMode;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn window(from: (i32, u32, u32), to: (i32, u32, u32)) -> SyncWindow {
        SyncWindow {
            start: Utc.with_ymd_and_hms(from.0, from.1, from.2, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(to.0, to.1, to.2, 0, 0, 0).unwrap(),
            mode: SyncMode::Default,
        }
    }

    fn master(start: NaiveDateTime, minutes: i64, tzid: Option<&str>, rrule: Option<&str>) -> RecurringEvent {
        let start = WallClock::new(start, tzid.map(String::from));
        RecurringEvent {
            template: ExternalEventInstance {
                uid: "class-1".into(),
                recurrence_id: "class-1".into(),
                end: start.shifted(Duration::minutes(minutes)),
                start,
                title: "Morning Flow".into(),
                description: None,
                location: Some("Studio A".into()),
                status: "confirmed".into(),
                is_all_day: false,
            },
            rrule: rrule.map(String::from),
            exdates: Vec::new(),
        }
    }

    #[test]
    fn daily_with_one_exdate_over_ten_days_yields_nine() {
        let mut event = master(at(2024, 3, 1, 9, 0), 60, Some("America/New_York"), Some("FREQ=DAILY"));
        event.exdates.push(ExceptionDate::Local(at(2024, 3, 5, 9, 0)));

        let instances = expand(&event, &window((2024, 3, 1), (2024, 3, 11)));

        assert_eq!(instances.len(), 9);
        assert!(instances
            .iter()
            .all(|i| i.start.naive.date() != NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()));
        assert!(instances.iter().all(|i| i.uid == "class-1"));
    }

    #[test]
    fn occurrences_keep_local_time_across_dst() {
        let event = master(at(2024, 3, 9, 9, 0), 60, Some("America/New_York"), Some("FREQ=DAILY;COUNT=2"));
        let instances = expand(&event, &window((2024, 3, 1), (2024, 3, 20)));

        let starts: Vec<_> = instances.iter().map(|i| i.start.to_utc()).collect();
        assert_eq!(
            starts,
            vec![
                Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap(),
            ]
        );
        assert_eq!(instances[1].recurrence_id, "2024-03-10T09:00:00");
    }

    #[test]
    fn duration_is_preserved_per_instance() {
        let event = master(at(2024, 3, 1, 18, 0), 75, None, Some("FREQ=WEEKLY;COUNT=3"));
        let instances = expand(&event, &window((2024, 2, 1), (2024, 4, 1)));
        assert_eq!(instances.len(), 3);
        for i in &instances {
            assert_eq!(i.end.naive - i.start.naive, Duration::minutes(75));
        }
    }

    #[test]
    fn utc_until_is_shifted_into_local_time() {
        // 18:00 in Berlin is 17:00Z, so the third occurrence sits exactly on UNTIL.
        let event = master(
            at(2024, 3, 1, 18, 0),
            60,
            Some("Europe/Berlin"),
            Some("FREQ=DAILY;UNTIL=20240303T170000Z"),
        );
        let instances = expand(&event, &window((2024, 2, 28), (2024, 3, 10)));
        assert_eq!(instances.len(), 3);
    }

    #[test]
    fn utc_exdate_matches_by_instant() {
        let mut event = master(at(2024, 6, 3, 9, 0), 60, Some("Europe/Berlin"), Some("FREQ=DAILY;COUNT=3"));
        event
            .exdates
            .push(ExceptionDate::Instant(Utc.with_ymd_and_hms(2024, 6, 4, 7, 0, 0).unwrap()));
        let instances = expand(&event, &window((2024, 6, 1), (2024, 6, 30)));
        let keys: Vec<_> = instances.iter().map(|i| i.recurrence_id.as_str()).collect();
        assert_eq!(keys, vec!["2024-06-03T09:00:00", "2024-06-05T09:00:00"]);
    }

    #[test]
    fn only_occurrences_inside_the_window_are_returned() {
        let event = master(at(2024, 1, 1, 9, 0), 60, None, Some("FREQ=DAILY"));
        let instances = expand(&event, &window((2024, 5, 1), (2024, 5, 4)));
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].recurrence_id, "2024-05-01T09:00:00");
    }

    #[test]
    fn non_recurring_and_malformed_rules_yield_the_master() {
        let single = master(at(2024, 5, 1, 9, 0), 60, None, None);
        let out = expand(&single, &window((2024, 5, 1), (2024, 5, 2)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recurrence_id, "class-1");

        let broken = master(at(2024, 5, 1, 9, 0), 60, None, Some("FREQ=SOMETIMES"));
        let out = expand(&broken, &window((2024, 5, 1), (2024, 5, 2)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recurrence_id, "class-1");
    }

    #[test]
    fn until_forms_are_normalized() {
        assert_eq!(
            wall_clock_rule("FREQ=WEEKLY;UNTIL=20240331", None),
            "FREQ=WEEKLY;UNTIL=20240331T235959Z"
        );
        assert_eq!(
            wall_clock_rule("RRULE:FREQ=DAILY;UNTIL=20240331T090000", Some("Europe/Berlin")),
            "FREQ=DAILY;UNTIL=20240331T090000Z"
        );
    }
}
