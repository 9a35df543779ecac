//! Wall-clock to UTC conversion.
//!
//! Offsets come from the compiled-in IANA database and are resolved for the specific
//! local date, so DST is honoured. Zone names the database does not know (Windows
//! names, bare abbreviations) fall back to a coarse seasonal table.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, LocalResult, NaiveDateTime, Offset, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A local date-time together with the zone it was written in.
///
/// `tzid == None` is a floating time, interpreted as UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallClock {
    pub naive: NaiveDateTime,
    pub tzid: Option<String>,
}

impl WallClock {
    pub fn new(naive: NaiveDateTime, tzid: Option<String>) -> Self {
        Self { naive, tzid }
    }

    pub fn utc(dt: DateTime<Utc>) -> Self {
        Self {
            naive: dt.naive_utc(),
            tzid: Some("UTC".to_string()),
        }
    }

    pub fn floating(naive: NaiveDateTime) -> Self {
        Self { naive, tzid: None }
    }

    pub fn to_utc(&self) -> DateTime<Utc> {
        to_utc(self.naive, self.tzid.as_deref())
    }

    /// The same zone, shifted by a wall-clock duration.
    pub fn shifted(&self, by: Duration) -> Self {
        Self {
            naive: self.naive + by,
            tzid: self.tzid.clone(),
        }
    }

    pub fn is_utc(&self) -> bool {
        self.tzid.as_deref().is_some_and(is_utc_name)
    }

    /// Identity string for one occurrence, taken from its original local start.
    pub fn occurrence_key(&self, all_day: bool) -> String {
        if all_day {
            self.naive.format("%Y-%m-%d").to_string()
        } else if self.is_utc() {
            self.naive.format("%Y-%m-%dT%H:%M:%SZ").to_string()
        } else {
            self.naive.format("%Y-%m-%dT%H:%M:%S").to_string()
        }
    }
}

fn is_utc_name(name: &str) -> bool {
    matches!(
        name.trim().to_ascii_uppercase().as_str(),
        "UTC" | "Z" | "GMT" | "ETC/UTC" | "ETC/GMT" | "ZULU"
    )
}

fn clean_tzid(tzid: &str) -> &str {
    tzid.trim().trim_matches('"')
}

/// Convert a local date-time in `tzid` to a UTC instant.
///
/// - No zone: the value is taken as UTC.
/// - Known zone: offset in effect on that local date. A time inside a spring-forward gap
///   uses the offset from before the transition; a fall-back time resolves to the earlier
///   instant.
/// - Unknown zone: [`heuristic_offset`], else UTC.
pub fn to_utc(local: NaiveDateTime, tzid: Option<&str>) -> DateTime<Utc> {
    let Some(tzid) = tzid.map(clean_tzid).filter(|t| !t.is_empty()) else {
        return Utc.from_utc_datetime(&local);
    };

    if is_utc_name(tzid) {
        return Utc.from_utc_datetime(&local);
    }

    match tzid.parse::<Tz>() {
        Ok(tz) => resolve_in_zone(&tz, local),
        Err(_) => {
            let offset = heuristic_offset(tzid, local).unwrap_or_else(|| {
                tracing::warn!("Unknown timezone '{}', treating {} as UTC", tzid, local);
                Utc.fix()
            });
            Utc.from_utc_datetime(&(local - Duration::seconds(offset.local_minus_utc() as i64)))
        }
    }
}

fn resolve_in_zone(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // Spring-forward gap: apply the offset in force a day earlier.
            let before = tz
                .offset_from_utc_datetime(&(local - Duration::hours(24)))
                .fix();
            Utc.from_utc_datetime(&(local - Duration::seconds(before.local_minus_utc() as i64)))
        }
    }
}

/// The local wall clock of a UTC instant in `tzid` (the inverse of [`to_utc`]).
pub fn to_wall_clock(instant: DateTime<Utc>, tzid: Option<&str>) -> NaiveDateTime {
    let Some(tzid) = tzid.map(clean_tzid).filter(|t| !t.is_empty()) else {
        return instant.naive_utc();
    };
    if is_utc_name(tzid) {
        return instant.naive_utc();
    }
    match tzid.parse::<Tz>() {
        Ok(tz) => instant.with_timezone(&tz).naive_local(),
        Err(_) => {
            let naive = instant.naive_utc();
            match heuristic_offset(tzid, naive) {
                Some(offset) => instant.with_timezone(&offset).naive_local(),
                None => naive,
            }
        }
    }
}

/// Standard and daylight offsets (hours) for zone families commonly seen under
/// non-IANA names.
const ZONE_FAMILIES: &[(&[&str], i32, i32)] = &[
    (
        &["central europe", "w. europe", "western europe", "romance", "cet", "cest"],
        1,
        2,
    ),
    (&["gmt standard", "greenwich", "uk", "bst", "london"], 0, 1),
    (&["eastern", "est", "edt"], -5, -4),
    (&["central", "cst", "cdt"], -6, -5),
    (&["mountain", "mst", "mdt"], -7, -6),
    (&["pacific", "pst", "pdt"], -8, -7),
];

/// Approximate offset for well-known zone families, assuming daylight time from April
/// through October. Only used when the database has no entry for the name.
pub fn heuristic_offset(tzid: &str, local: NaiveDateTime) -> Option<FixedOffset> {
    let name = tzid.to_ascii_lowercase();
    let matches_family = |needle: &str| {
        if needle.len() <= 4 {
            name.split(|c: char| !c.is_ascii_alphanumeric())
                .any(|word| word == needle)
        } else {
            name.contains(needle)
        }
    };

    let (_, standard, daylight) = ZONE_FAMILIES
        .iter()
        .find(|(needles, _, _)| needles.iter().any(|n| matches_family(n)))?;

    let summer = (4..=10).contains(&local.month());
    let hours = if summer { *daylight } else { *standard };
    FixedOffset::east_opt(hours * 3600)
}
