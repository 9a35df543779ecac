use std::collections::{HashMap, HashSet};

use sqlx::{Row, SqlitePool};

use crate::db::models::*;
use crate::error::{AppError, AppResult};

// ============================================================================
// Rule Repository (tags, tag rules, billing entities, sync filter rules)
// ============================================================================

pub struct RuleRepository;

/// Decode a JSON string-array column. Unreadable values degrade to an empty list.
fn json_list(raw: Option<String>, what: &str, owner: &str) -> Vec<String> {
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(list) => list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(e) => {
            tracing::warn!("Ignoring unreadable {} on {}: {}", what, owner, e);
            Vec::new()
        }
    }
}

impl RuleRepository {
    /// Map of tag id to slug for one user.
    pub async fn tag_slugs(pool: &SqlitePool, user_id: &str) -> AppResult<HashMap<String, String>> {
        let rows = sqlx::query("SELECT id, slug FROM tags WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("id"), r.get("slug")))
            .collect())
    }

    pub async fn list_tag_rules(pool: &SqlitePool, user_id: &str) -> AppResult<Vec<TagRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, tag_id, keyword, keywords, location_keywords
            FROM tag_rules
            WHERE user_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let id: String = r.get("id");
                let keywords = json_list(r.get("keywords"), "keywords", &id);
                let location_keywords =
                    json_list(r.get("location_keywords"), "location_keywords", &id);
                TagRule::from_columns(
                    id,
                    r.get("user_id"),
                    r.get("tag_id"),
                    r.get("keyword"),
                    keywords,
                    location_keywords,
                )
            })
            .collect())
    }

    /// Studio location patterns in matching order (oldest studio first).
    pub async fn list_studio_patterns(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<StudioPattern>> {
        let entities = Self::list_billing_entities(pool, user_id).await?;

        Ok(entities
            .into_iter()
            .filter(|e| e.entity_type == EntityType::Studio && !e.location_match.is_empty())
            .map(|e| StudioPattern {
                studio_id: e.id,
                patterns: e.location_match,
            })
            .collect())
    }

    pub async fn teacher_entity_ids(pool: &SqlitePool, user_id: &str) -> AppResult<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT id FROM billing_entities WHERE user_id = ? AND entity_type = 'teacher'",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    pub async fn list_billing_entities(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<BillingEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, name, entity_type, location_match
            FROM billing_entities
            WHERE user_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let id: String = r.get("id");
                let entity_type = EntityType::parse(&r.get::<String, _>("entity_type"))?;
                let location_match = json_list(r.get("location_match"), "location_match", &id);
                Some(BillingEntity {
                    id,
                    user_id: r.get("user_id"),
                    name: r.get("name"),
                    entity_type,
                    location_match,
                })
            })
            .collect())
    }

    /// Active filter rules of one feed. Rows with an unknown target or mode are skipped.
    pub async fn active_filter_rules(
        pool: &SqlitePool,
        user_id: &str,
        feed_id: &str,
    ) -> AppResult<Vec<SyncFilterRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, feed_id, target, match_mode, pattern, is_active
            FROM sync_filter_rules
            WHERE user_id = ? AND feed_id = ? AND is_active = 1
            ORDER BY created_at, id
            "#,
        )
        .bind(user_id)
        .bind(feed_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let id: String = r.get("id");
                let target: String = r.get("target");
                let mode: String = r.get("match_mode");
                let (Some(target), Some(match_mode)) =
                    (FilterTarget::parse(&target), MatchMode::parse(&mode))
                else {
                    tracing::warn!(
                        "Skipping filter rule {} with target '{}' and mode '{}'",
                        id,
                        target,
                        mode
                    );
                    return None;
                };
                Some(SyncFilterRule {
                    id,
                    user_id: r.get("user_id"),
                    feed_id: r.get("feed_id"),
                    target,
                    match_mode,
                    pattern: r.get("pattern"),
                    is_active: r.get("is_active"),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;

    #[tokio::test]
    async fn studios_come_back_in_creation_order_without_teachers() {
        let pool = memory_pool().await;
        insert_billing_entity(&pool, "s2", "u1", "studio", &["main st"], "2024-02-01 00:00:00").await;
        insert_billing_entity(&pool, "s1", "u1", "studio", &["studio a"], "2024-01-01 00:00:00").await;
        insert_billing_entity(&pool, "t1", "u1", "teacher", &["studio a"], "2023-01-01 00:00:00").await;
        insert_billing_entity(&pool, "s3", "u2", "studio", &["studio a"], "2023-01-01 00:00:00").await;

        let studios = RuleRepository::list_studio_patterns(&pool, "u1").await.unwrap();
        let ids: Vec<_> = studios.iter().map(|s| s.studio_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        let teachers = RuleRepository::teacher_entity_ids(&pool, "u1").await.unwrap();
        assert!(teachers.contains("t1"));
        assert_eq!(teachers.len(), 1);
    }

    #[tokio::test]
    async fn tag_rules_decode_both_shapes() {
        let pool = memory_pool().await;
        insert_tag(&pool, "t-yin", "u1", "yin").await;
        insert_tag(&pool, "t-flow", "u1", "vinyasa").await;
        insert_tag_rule(&pool, "r1", "u1", "t-yin", Some("yin"), &[], &[]).await;
        insert_tag_rule(&pool, "r2", "u1", "t-flow", None, &["vinyasa"], &["studio a"]).await;
        insert_tag_rule(&pool, "r3", "u1", "t-flow", None, &[], &[]).await;

        let rules = RuleRepository::list_tag_rules(&pool, "u1").await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules
            .iter()
            .any(|r| matches!(&r.kind, TagRuleKind::LegacyKeyword { keyword } if keyword == "yin")));

        let slugs = RuleRepository::tag_slugs(&pool, "u1").await.unwrap();
        assert_eq!(slugs.get("t-flow").map(String::as_str), Some("vinyasa"));
    }

    #[tokio::test]
    async fn only_active_filter_rules_for_the_feed_are_loaded() {
        let pool = memory_pool().await;
        insert_feed(&pool, "f1", "u1", "https://example.com/a.ics", "mixed_calendar", true).await;
        insert_feed(&pool, "f2", "u1", "https://example.com/b.ics", "mixed_calendar", true).await;
        insert_filter_rule(&pool, "a", "u1", "f1", "title", "contains", "yoga", true).await;
        insert_filter_rule(&pool, "b", "u1", "f1", "title", "contains", "pilates", false).await;
        insert_filter_rule(&pool, "c", "u1", "f2", "location", "regex", "^studio", true).await;

        let rules = RuleRepository::active_filter_rules(&pool, "u1", "f1").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pattern, "yoga");
        assert_eq!(rules[0].match_mode, MatchMode::Contains);
    }
}
