use chrono::NaiveDateTime;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};

use crate::db::models::*;
use crate::error::{AppError, AppResult};

// ============================================================================
// Calendar Feed Repository
// ============================================================================

pub struct FeedRepository;

const FEED_COLUMNS: &str = r#"
    id, user_id, name, source, sync_approach, filtering_enabled,
    last_synced_at, created_at, updated_at
"#;

fn map_feed(r: &SqliteRow) -> AppResult<CalendarFeed> {
    let approach: String = r.get("sync_approach");
    let sync_approach = SyncApproach::parse(&approach).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!(
            "Unknown sync approach '{}' on feed {}",
            approach,
            r.get::<String, _>("id")
        ))
    })?;

    Ok(CalendarFeed {
        id: r.get("id"),
        user_id: r.get("user_id"),
        name: r.get("name"),
        source: r.get("source"),
        sync_approach,
        filtering_enabled: r.get("filtering_enabled"),
        last_synced_at: r.get("last_synced_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

impl FeedRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<CalendarFeed>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM calendar_feeds WHERE id = ?",
            FEED_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        row.as_ref().map(map_feed).transpose()
    }

    /// Feeds are only visible to their owner.
    pub async fn find_for_user(
        pool: &SqlitePool,
        id: &str,
        user_id: &str,
    ) -> AppResult<Option<CalendarFeed>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM calendar_feeds WHERE id = ? AND user_id = ?",
            FEED_COLUMNS
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        row.as_ref().map(map_feed).transpose()
    }

    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<CalendarFeed>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM calendar_feeds ORDER BY created_at, id",
            FEED_COLUMNS
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        rows.iter().map(map_feed).collect()
    }

    /// Record a completed sync. Runs on whatever executor the caller hands in so it can
    /// share the reconciliation transaction.
    pub async fn mark_synced<'e, E>(
        executor: E,
        feed_id: &str,
        synced_at: NaiveDateTime,
    ) -> AppResult<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query("UPDATE calendar_feeds SET last_synced_at = ?, updated_at = ? WHERE id = ?")
            .bind(synced_at)
            .bind(synced_at)
            .bind(feed_id)
            .execute(executor)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }
}
