use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Canonical Event Models
// ============================================================================

/// Invoice type that marks an event as billed through another teacher.
pub const TEACHER_INVOICE: &str = "teacher_invoice";

/// Identity of an event within one user's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub uid: String,
    pub recurrence_id: String,
}

impl EventKey {
    pub fn new(uid: impl Into<String>, recurrence_id: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            recurrence_id: recurrence_id.into(),
        }
    }
}

/// A persisted event as loaded for reconciliation and rematching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub user_id: String,
    pub feed_id: Option<String>,
    pub uid: String,
    pub recurrence_id: String,
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub studio_id: Option<String>,
    pub students_studio: Option<i64>,
    pub students_online: Option<i64>,
    pub status: String,
    pub visibility: String,
    pub invoice_type: Option<String>,
    pub substitute_notes: Option<String>,
    /// Derived once at load time, see [`is_manual_override`].
    pub manually_overridden: bool,
}

impl StoredEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.uid.clone(), self.recurrence_id.clone())
    }
}

/// Whether a human has taken over the billing assignment of an event.
///
/// Any of: billed as a teacher invoice, substitute notes present, or the assigned
/// billing entity is a teacher rather than a studio.
pub fn is_manual_override(
    invoice_type: Option<&str>,
    substitute_notes: Option<&str>,
    studio_entity_type: Option<&str>,
) -> bool {
    invoice_type == Some(TEACHER_INVOICE)
        || substitute_notes.is_some_and(|n| !n.trim().is_empty())
        || studio_entity_type == Some("teacher")
}

/// A freshly fetched and enriched event, ready to be written with upsert semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertEvent {
    pub user_id: String,
    pub feed_id: String,
    pub uid: String,
    pub recurrence_id: String,
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub studio_id: Option<String>,
    pub status: String,
    /// Student counts written on insert only (historical syncs start at zero).
    pub initial_student_count: Option<i64>,
}

impl UpsertEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.uid.clone(), self.recurrence_id.clone())
    }

    /// True when writing this event over `stored` would change a sync-owned column.
    pub fn differs_from(&self, stored: &StoredEvent) -> bool {
        self.title != stored.title
            || self.start_time != stored.start_time
            || self.end_time != stored.end_time
            || self.location != stored.location
            || self.description != stored.description
            || self.tags != stored.tags
            || self.studio_id != stored.studio_id
            || self.status != stored.status
            || stored.feed_id.as_deref() != Some(self.feed_id.as_str())
    }
}

/// Partial update produced by a rematch. `None` leaves the column untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventPatch {
    pub event_id: String,
    pub tags: Option<Vec<String>>,
    pub studio_id: Option<Option<String>>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self.tags.is_none() && self.studio_id.is_none()
    }
}

/// Storage format for event instants: UTC, second precision, `Z` suffix.
pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stored() -> StoredEvent {
        StoredEvent {
            id: "ev-1".into(),
            user_id: "u1".into(),
            feed_id: Some("feed-1".into()),
            uid: "uid-1".into(),
            recurrence_id: "uid-1".into(),
            title: "Vinyasa".into(),
            start_time: "2024-05-01T08:00:00Z".into(),
            end_time: "2024-05-01T09:00:00Z".into(),
            location: Some("Studio A".into()),
            description: None,
            tags: vec!["vinyasa".into()],
            studio_id: Some("studio-a".into()),
            students_studio: None,
            students_online: None,
            status: "confirmed".into(),
            visibility: "visible".into(),
            invoice_type: None,
            substitute_notes: None,
            manually_overridden: false,
        }
    }

    fn upsert_for(stored: &StoredEvent) -> UpsertEvent {
        UpsertEvent {
            user_id: stored.user_id.clone(),
            feed_id: "feed-1".into(),
            uid: stored.uid.clone(),
            recurrence_id: stored.recurrence_id.clone(),
            title: stored.title.clone(),
            start_time: stored.start_time.clone(),
            end_time: stored.end_time.clone(),
            location: stored.location.clone(),
            description: stored.description.clone(),
            tags: stored.tags.clone(),
            studio_id: stored.studio_id.clone(),
            status: stored.status.clone(),
            initial_student_count: None,
        }
    }

    #[test]
    fn manual_override_signals() {
        assert!(!is_manual_override(None, None, Some("studio")));
        assert!(is_manual_override(Some("teacher_invoice"), None, None));
        assert!(is_manual_override(None, Some("Covered for Anna"), None));
        assert!(!is_manual_override(None, Some("   "), None));
        assert!(is_manual_override(Some("studio_invoice"), None, Some("teacher")));
    }

    #[test]
    fn identical_upsert_does_not_differ() {
        let s = stored();
        let mut u = upsert_for(&s);
        assert!(!u.differs_from(&s));

        u.location = Some("Studio B".into());
        assert!(u.differs_from(&s));
    }

    #[test]
    fn user_owned_columns_are_not_compared() {
        let mut s = stored();
        let u = upsert_for(&s);
        s.invoice_type = Some(TEACHER_INVOICE.into());
        s.substitute_notes = Some("sub".into());
        s.students_studio = Some(12);
        assert!(!u.differs_from(&s));
    }

    #[test]
    fn format_utc_is_second_precision_zulu() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap();
        assert_eq!(format_utc(dt), "2024-03-10T07:30:00Z");
    }
}
