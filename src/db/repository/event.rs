use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

// ============================================================================
// Event Repository
// ============================================================================

pub struct EventRepository;

/// Events joined with the billing entity they are assigned to, so the manual-override
/// flag can be derived while mapping.
const EVENT_SELECT: &str = r#"
    SELECT
        e.id, e.user_id, e.feed_id, e.uid, e.recurrence_id, e.title,
        e.start_time, e.end_time, e.location, e.description, e.tags,
        e.studio_id, e.students_studio, e.students_online,
        e.status, e.visibility, e.invoice_type, e.substitute_notes,
        b.entity_type AS studio_entity_type
    FROM events e
    LEFT JOIN billing_entities b ON b.id = e.studio_id
"#;

fn map_event(r: &SqliteRow) -> StoredEvent {
    let id: String = r.get("id");
    let raw_tags: String = r.get("tags");
    let tags = serde_json::from_str::<Vec<String>>(&raw_tags).unwrap_or_else(|e| {
        tracing::warn!("Event {} has unreadable tags ({}); treating as empty", id, e);
        Vec::new()
    });

    let invoice_type: Option<String> = r.get("invoice_type");
    let substitute_notes: Option<String> = r.get("substitute_notes");
    let studio_entity_type: Option<String> = r.get("studio_entity_type");
    let manually_overridden = is_manual_override(
        invoice_type.as_deref(),
        substitute_notes.as_deref(),
        studio_entity_type.as_deref(),
    );

    StoredEvent {
        id,
        user_id: r.get("user_id"),
        feed_id: r.get("feed_id"),
        uid: r.get("uid"),
        recurrence_id: r.get("recurrence_id"),
        title: r.get("title"),
        start_time: r.get("start_time"),
        end_time: r.get("end_time"),
        location: r.get("location"),
        description: r.get("description"),
        tags,
        studio_id: r.get("studio_id"),
        students_studio: r.get("students_studio"),
        students_online: r.get("students_online"),
        status: r.get("status"),
        visibility: r.get("visibility"),
        invoice_type,
        substitute_notes,
        manually_overridden,
    }
}

fn tags_json(tags: &[String]) -> AppResult<String> {
    serde_json::to_string(tags)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode tags: {}", e)))
}

impl EventRepository {
    /// Stored events of one feed whose start falls in `[window_start, window_end)`.
    ///
    /// Bounds are UTC strings in the same format as `start_time`, so string comparison
    /// orders them correctly.
    pub async fn find_in_window(
        pool: &SqlitePool,
        user_id: &str,
        feed_id: &str,
        window_start: &str,
        window_end: &str,
    ) -> AppResult<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            "{} WHERE e.user_id = ? AND e.feed_id = ? AND e.start_time >= ? AND e.start_time < ? \
             ORDER BY e.start_time, e.id",
            EVENT_SELECT
        ))
        .bind(user_id)
        .bind(feed_id)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows.iter().map(map_event).collect())
    }

    /// Candidate events for a rematch, optionally narrowed to a feed and/or explicit ids.
    pub async fn find_for_rematch(
        pool: &SqlitePool,
        user_id: &str,
        feed_id: Option<&str>,
        event_ids: Option<&[String]>,
    ) -> AppResult<Vec<StoredEvent>> {
        if matches!(event_ids, Some(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(EVENT_SELECT);
        qb.push(" WHERE e.user_id = ").push_bind(user_id);

        if let Some(feed_id) = feed_id {
            qb.push(" AND e.feed_id = ").push_bind(feed_id);
        }

        if let Some(ids) = event_ids {
            qb.push(" AND e.id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
        }

        qb.push(" ORDER BY e.start_time, e.id");

        let rows = qb
            .build()
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows.iter().map(map_event).collect())
    }

    /// Insert or update one event keyed on `(user_id, uid, recurrence_id)`.
    ///
    /// User-owned columns (visibility, invoice type, substitute notes) are only written on
    /// insert. Student counts keep any stored value. A manually overridden row keeps its
    /// studio.
    pub async fn upsert<'e, E>(executor: E, event: &UpsertEvent) -> AppResult<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO events (
                id, user_id, feed_id, uid, recurrence_id, title,
                start_time, end_time, location, description, tags, studio_id,
                students_studio, students_online, status,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, uid, recurrence_id) DO UPDATE SET
                feed_id = excluded.feed_id,
                title = excluded.title,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                location = excluded.location,
                description = excluded.description,
                tags = excluded.tags,
                studio_id = CASE
                    WHEN events.invoice_type = 'teacher_invoice'
                        OR TRIM(COALESCE(events.substitute_notes, '')) <> ''
                        OR EXISTS (
                            SELECT 1 FROM billing_entities b
                            WHERE b.id = events.studio_id AND b.entity_type = 'teacher'
                        )
                    THEN events.studio_id
                    ELSE excluded.studio_id
                END,
                students_studio = COALESCE(events.students_studio, excluded.students_studio),
                students_online = COALESCE(events.students_online, excluded.students_online),
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(&event.user_id)
        .bind(&event.feed_id)
        .bind(&event.uid)
        .bind(&event.recurrence_id)
        .bind(&event.title)
        .bind(&event.start_time)
        .bind(&event.end_time)
        .bind(&event.location)
        .bind(&event.description)
        .bind(tags_json(&event.tags)?)
        .bind(&event.studio_id)
        .bind(event.initial_student_count)
        .bind(event.initial_student_count)
        .bind(&event.status)
        .bind(now)
        .bind(now)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn delete_by_id<'e, E>(executor: E, id: &str) -> AppResult<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Write only the columns present in the patch. Returns whether a row was touched.
    pub async fn apply_patch(pool: &SqlitePool, patch: &EventPatch) -> AppResult<bool> {
        if patch.is_empty() {
            return Ok(false);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE events SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(tags) = &patch.tags {
                set.push("tags = ").push_bind_unseparated(tags_json(tags)?);
            }
            if let Some(studio_id) = &patch.studio_id {
                set.push("studio_id = ")
                    .push_bind_unseparated(studio_id.clone());
            }
            set.push("updated_at = ")
                .push_bind_unseparated(Utc::now().naive_utc());
        }
        qb.push(" WHERE id = ").push_bind(&patch.event_id);

        let result = qb
            .build()
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_for_feed(pool: &SqlitePool, feed_id: &str) -> AppResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM events WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(row.get("total"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{insert_billing_entity, insert_feed, memory_pool};

    fn upsert_event(uid: &str, start: &str, studio: Option<&str>) -> UpsertEvent {
        UpsertEvent {
            user_id: "u1".into(),
            feed_id: "f1".into(),
            uid: uid.into(),
            recurrence_id: uid.into(),
            title: "Morning Flow".into(),
            start_time: start.into(),
            end_time: start.replace("T08", "T09"),
            location: Some("Studio A".into()),
            description: None,
            tags: vec!["vinyasa".into()],
            studio_id: studio.map(String::from),
            status: "confirmed".into(),
            initial_student_count: None,
        }
    }

    async fn setup() -> SqlitePool {
        let pool = memory_pool().await;
        insert_feed(&pool, "f1", "u1", "https://example.com/a.ics", "yoga_only", false).await;
        pool
    }

    #[tokio::test]
    async fn upsert_is_keyed_on_uid_and_recurrence_id() {
        let pool = setup().await;
        let mut ev = upsert_event("a", "2024-05-01T08:00:00Z", None);
        EventRepository::upsert(&pool, &ev).await.unwrap();
        ev.title = "Evening Flow".into();
        EventRepository::upsert(&pool, &ev).await.unwrap();

        let rows = EventRepository::find_for_rematch(&pool, "u1", None, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Evening Flow");
        assert_eq!(rows[0].tags, vec!["vinyasa".to_string()]);
        assert_eq!(EventRepository::count_for_feed(&pool, "f1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_preserves_user_owned_columns() {
        let pool = setup().await;
        let mut ev = upsert_event("a", "2024-05-01T08:00:00Z", Some("studio-a"));
        ev.initial_student_count = Some(0);
        EventRepository::upsert(&pool, &ev).await.unwrap();
        sqlx::query(
            "UPDATE events SET invoice_type = 'teacher_invoice', visibility = 'hidden', students_studio = 7",
        )
        .execute(&pool)
        .await
        .unwrap();

        ev.studio_id = Some("studio-b".into());
        ev.initial_student_count = None;
        EventRepository::upsert(&pool, &ev).await.unwrap();

        let stored = &EventRepository::find_for_rematch(&pool, "u1", None, None)
            .await
            .unwrap()[0];
        assert_eq!(stored.visibility, "hidden");
        assert_eq!(stored.invoice_type.as_deref(), Some(TEACHER_INVOICE));
        assert_eq!(stored.students_studio, Some(7));
        assert_eq!(stored.students_online, Some(0));
        assert_eq!(stored.studio_id.as_deref(), Some("studio-a"));
        assert!(stored.manually_overridden);
    }

    #[tokio::test]
    async fn teacher_assignment_counts_as_override() {
        let pool = setup().await;
        insert_billing_entity(&pool, "teacher-1", "u1", "teacher", &[], "2024-01-01 00:00:00").await;
        EventRepository::upsert(&pool, &upsert_event("a", "2024-05-01T08:00:00Z", Some("teacher-1")))
            .await
            .unwrap();

        let stored = &EventRepository::find_for_rematch(&pool, "u1", None, None)
            .await
            .unwrap()[0];
        assert!(stored.manually_overridden);
    }

    #[tokio::test]
    async fn window_query_is_half_open() {
        let pool = setup().await;
        for (uid, start) in [
            ("a", "2024-05-01T08:00:00Z"),
            ("b", "2024-05-02T08:00:00Z"),
            ("c", "2024-05-03T08:00:00Z"),
        ] {
            EventRepository::upsert(&pool, &upsert_event(uid, start, None))
                .await
                .unwrap();
        }

        let rows = EventRepository::find_in_window(
            &pool,
            "u1",
            "f1",
            "2024-05-01T08:00:00Z",
            "2024-05-03T08:00:00Z",
        )
        .await
        .unwrap();
        let uids: Vec<_> = rows.iter().map(|r| r.uid.as_str()).collect();
        assert_eq!(uids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn patch_writes_only_given_columns() {
        let pool = setup().await;
        EventRepository::upsert(&pool, &upsert_event("a", "2024-05-01T08:00:00Z", Some("studio-a")))
            .await
            .unwrap();
        let id = EventRepository::find_for_rematch(&pool, "u1", None, None)
            .await
            .unwrap()[0]
            .id
            .clone();

        let patch = EventPatch {
            event_id: id.clone(),
            tags: Some(vec!["yin".into()]),
            studio_id: None,
        };
        assert!(EventRepository::apply_patch(&pool, &patch).await.unwrap());

        let ids = vec![id];
        let stored = &EventRepository::find_for_rematch(&pool, "u1", Some("f1"), Some(&ids))
            .await
            .unwrap()[0];
        assert_eq!(stored.tags, vec!["yin".to_string()]);
        assert_eq!(stored.studio_id.as_deref(), Some("studio-a"));
    }
}
