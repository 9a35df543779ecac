//! Re-applying the current tag and studio rules to already stored events.

use std::collections::{BTreeSet, HashMap, HashSet};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::models::{EventPatch, StoredEvent};
use crate::db::{EventRepository, RuleRepository};
use crate::error::{AppError, AppResult};
use crate::services::matching::{event_content, Matcher};

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct RematchRequest {
    pub user_id: String,
    pub feed_id: Option<String>,
    pub event_ids: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub rematch_tags: bool,
    #[serde(default = "default_true")]
    pub rematch_studios: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RematchOutcome {
    pub total_events_processed: usize,
    pub updated_count: usize,
}

/// What the rematch needs to know about the user's rules.
struct RuleSet {
    matcher: Matcher,
    teacher_ids: HashSet<String>,
}

impl RuleSet {
    /// The partial update for `event`, or `None` when nothing changed.
    fn patch_for(&self, event: &StoredEvent, tags: bool, studios: bool) -> Option<EventPatch> {
        let mut patch = EventPatch {
            event_id: event.id.clone(),
            ..Default::default()
        };

        if tags {
            let content = event_content(&event.title, event.description.as_deref());
            let matched = self.matcher.match_tags(&content, event.location.as_deref());
            let current: BTreeSet<&str> = event.tags.iter().map(String::as_str).collect();
            let next: BTreeSet<&str> = matched.iter().map(String::as_str).collect();
            if current != next {
                patch.tags = Some(matched);
            }
        }

        let assigned_to_teacher = event
            .studio_id
            .as_ref()
            .is_some_and(|id| self.teacher_ids.contains(id));
        if studios && !event.manually_overridden && !assigned_to_teacher {
            let matched = self.matcher.match_studio(event.location.as_deref());
            if matched != event.studio_id {
                patch.studio_id = Some(matched);
            }
        }

        (!patch.is_empty()).then_some(patch)
    }
}

async fn load_rules(
    pool: &SqlitePool,
    user_id: &str,
    tags: bool,
    studios: bool,
) -> AppResult<RuleSet> {
    let tag_rules = async {
        if tags {
            RuleRepository::list_tag_rules(pool, user_id).await
        } else {
            Ok(Vec::new())
        }
    };
    let tag_slugs = async {
        if tags {
            RuleRepository::tag_slugs(pool, user_id).await
        } else {
            Ok(HashMap::new())
        }
    };
    let studio_patterns = async {
        if studios {
            RuleRepository::list_studio_patterns(pool, user_id).await
        } else {
            Ok(Vec::new())
        }
    };
    let teacher_ids = async {
        if studios {
            RuleRepository::teacher_entity_ids(pool, user_id).await
        } else {
            Ok(HashSet::new())
        }
    };

    let (tag_rules, tag_slugs, studio_patterns, teacher_ids) =
        tokio::try_join!(tag_rules, tag_slugs, studio_patterns, teacher_ids)?;

    Ok(RuleSet {
        matcher: Matcher::new(tag_rules, tag_slugs, studio_patterns),
        teacher_ids,
    })
}

/// Recompute tags and studios for the requested events and write what changed.
///
/// Batches are written one after another; rows within a batch are written
/// concurrently. A failed row aborts the run with its batch index. Earlier batches
/// stay committed.
pub async fn rematch(
    pool: &SqlitePool,
    request: &RematchRequest,
    max_batch_size: usize,
) -> AppResult<RematchOutcome> {
    if request.batch_size == 0 || request.batch_size > max_batch_size {
        return Err(AppError::Validation(format!(
            "batch_size must be between 1 and {}",
            max_batch_size
        )));
    }

    let events_fut = EventRepository::find_for_rematch(
        pool,
        &request.user_id,
        request.feed_id.as_deref(),
        request.event_ids.as_deref(),
    );
    let rules_fut = load_rules(
        pool,
        &request.user_id,
        request.rematch_tags,
        request.rematch_studios,
    );
    let (events, rules) = tokio::try_join!(events_fut, rules_fut)?;

    tracing::info!(
        "Rematching {} events for user {} (tags: {}, studios: {}, batch size: {})",
        events.len(),
        request.user_id,
        request.rematch_tags,
        request.rematch_studios,
        request.batch_size
    );

    let mut outcome = RematchOutcome {
        total_events_processed: events.len(),
        updated_count: 0,
    };

    for (batch_index, batch) in events.chunks(request.batch_size).enumerate() {
        let patches: Vec<EventPatch> = batch
            .iter()
            .filter_map(|event| {
                rules.patch_for(event, request.rematch_tags, request.rematch_studios)
            })
            .collect();
        if patches.is_empty() {
            continue;
        }

        let results = join_all(
            patches
                .iter()
                .map(|patch| EventRepository::apply_patch(pool, patch)),
        )
        .await;

        for result in results {
            match result {
                Ok(true) => outcome.updated_count += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Rematch batch {} failed: {}", batch_index, e);
                    return Err(AppError::BatchWrite {
                        batch_index,
                        message: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            "Rematch batch {} wrote {} of {} events",
            batch_index,
            patches.len(),
            batch.len()
        );
    }

    tracing::info!(
        "Rematch for user {} updated {} of {} events",
        request.user_id,
        outcome.updated_count,
        outcome.total_events_processed
    );

    Ok(outcome)
}
