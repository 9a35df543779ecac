//! Diffing fetched events against stored ones and writing the difference.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::models::{EventKey, StoredEvent, UpsertEvent};
use crate::db::{EventRepository, FeedRepository};
use crate::error::{AppError, AppResult};

/// What a reconciliation will write.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Ids of stored rows whose key no longer appears upstream.
    pub stale_ids: Vec<String>,
    /// New or changed rows, in fetch order.
    pub upserts: Vec<UpsertEvent>,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl ReconcileOutcome {
    /// Events the feed publishes in the window after this sync.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Compute the plan for one feed and window.
///
/// `fresh` is collapsed on `(uid, recurrence_id)` with the last value winning. A
/// stored row that is manually overridden keeps its studio.
pub fn plan(fresh: Vec<UpsertEvent>, stored: &[StoredEvent]) -> ReconcilePlan {
    let mut positions: HashMap<EventKey, usize> = HashMap::new();
    let mut deduped: Vec<UpsertEvent> = Vec::with_capacity(fresh.len());
    for event in fresh {
        let key = event.key();
        match positions.get(&key) {
            Some(&idx) => deduped[idx] = event,
            None => {
                positions.insert(key, deduped.len());
                deduped.push(event);
            }
        }
    }

    let stored_by_key: HashMap<EventKey, &StoredEvent> =
        stored.iter().map(|s| (s.key(), s)).collect();

    let mut plan = ReconcilePlan {
        stale_ids: stored
            .iter()
            .filter(|s| !positions.contains_key(&s.key()))
            .map(|s| s.id.clone())
            .collect(),
        ..Default::default()
    };

    for mut event in deduped {
        match stored_by_key.get(&event.key()) {
            None => {
                plan.inserted += 1;
                plan.upserts.push(event);
            }
            Some(existing) => {
                if existing.manually_overridden {
                    event.studio_id = existing.studio_id.clone();
                }
                if event.differs_from(existing) {
                    plan.updated += 1;
                    plan.upserts.push(event);
                } else {
                    plan.unchanged += 1;
                }
            }
        }
    }

    plan
}

/// Write `plan` and stamp the feed in a single transaction.
///
/// Deletes run before upserts; the two sets never share a key.
pub async fn apply(
    pool: &SqlitePool,
    feed_id: &str,
    plan: ReconcilePlan,
    synced_at: NaiveDateTime,
) -> AppResult<ReconcileOutcome> {
    let mut tx = pool.begin().await.map_err(AppError::Database)?;

    for id in &plan.stale_ids {
        EventRepository::delete_by_id(&mut *tx, id).await?;
    }
    for event in &plan.upserts {
        EventRepository::upsert(&mut *tx, event).await?;
    }
    FeedRepository::mark_synced(&mut *tx, feed_id, synced_at).await?;

    tx.commit().await.map_err(AppError::Database)?;

    Ok(ReconcileOutcome {
        inserted: plan.inserted,
        updated: plan.updated,
        unchanged: plan.unchanged,
        deleted: plan.stale_ids.len(),
    })
}
