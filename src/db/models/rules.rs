use serde::{Deserialize, Serialize};

// ============================================================================
// Classification Rule Models (tags, studios, sync filters)
// ============================================================================

/// How a tag rule decides whether an event matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagRuleKind {
    /// Older rules carry a single keyword looked up in title + description.
    LegacyKeyword { keyword: String },
    /// Keywords looked up in title + description, and keywords looked up in the location.
    KeywordLists {
        keywords: Vec<String>,
        location_keywords: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRule {
    pub id: String,
    pub user_id: String,
    pub tag_id: String,
    pub kind: TagRuleKind,
}

impl TagRule {
    /// Build a rule from its stored columns. Returns `None` when no keyword is set at all.
    ///
    /// A row that carries both the legacy keyword and keyword lists is read as a
    /// list rule with the legacy keyword folded into the content keywords.
    pub fn from_columns(
        id: String,
        user_id: String,
        tag_id: String,
        keyword: Option<String>,
        keywords: Vec<String>,
        location_keywords: Vec<String>,
    ) -> Option<Self> {
        let keyword = keyword.filter(|k| !k.trim().is_empty());

        let kind = if !keywords.is_empty() || !location_keywords.is_empty() {
            let mut keywords = keywords;
            if let Some(legacy) = keyword {
                keywords.push(legacy);
            }
            TagRuleKind::KeywordLists {
                keywords,
                location_keywords,
            }
        } else {
            TagRuleKind::LegacyKeyword { keyword: keyword? }
        };

        Some(Self {
            id,
            user_id,
            tag_id,
            kind,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Studio,
    Teacher,
}

impl EntityType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "studio" => Some(EntityType::Studio),
            "teacher" => Some(EntityType::Teacher),
            _ => None,
        }
    }
}

/// A studio or teacher that invoices are addressed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEntity {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub entity_type: EntityType,
    /// Substrings matched case-insensitively against event locations.
    pub location_match: Vec<String>,
}

/// Location patterns of one studio, in matching order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudioPattern {
    pub studio_id: String,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterTarget {
    Title,
    Location,
    Description,
}

impl FilterTarget {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "title" => Some(FilterTarget::Title),
            "location" => Some(FilterTarget::Location),
            "description" => Some(FilterTarget::Description),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Contains,
    Exact,
    StartsWith,
    EndsWith,
    Regex,
}

impl MatchMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contains" => Some(MatchMode::Contains),
            "exact" => Some(MatchMode::Exact),
            "starts_with" => Some(MatchMode::StartsWith),
            "ends_with" => Some(MatchMode::EndsWith),
            "regex" => Some(MatchMode::Regex),
            _ => None,
        }
    }
}

/// User-authored rule deciding which events of a mixed calendar are imported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFilterRule {
    pub id: String,
    pub user_id: String,
    pub feed_id: String,
    pub target: FilterTarget,
    pub match_mode: MatchMode,
    pub pattern: String,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(keyword: Option<&str>, keywords: &[&str], location: &[&str]) -> Option<TagRule> {
        TagRule::from_columns(
            "r1".into(),
            "u1".into(),
            "t1".into(),
            keyword.map(String::from),
            keywords.iter().map(|s| s.to_string()).collect(),
            location.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn legacy_only_rows_become_legacy_rules() {
        let r = rule(Some("yin"), &[], &[]).unwrap();
        assert_eq!(
            r.kind,
            TagRuleKind::LegacyKeyword {
                keyword: "yin".into()
            }
        );
    }

    #[test]
    fn legacy_keyword_is_folded_into_lists() {
        let r = rule(Some("yin"), &["restorative"], &["studio a"]).unwrap();
        assert_eq!(
            r.kind,
            TagRuleKind::KeywordLists {
                keywords: vec!["restorative".into(), "yin".into()],
                location_keywords: vec!["studio a".into()],
            }
        );
    }

    #[test]
    fn rows_without_keywords_are_skipped() {
        assert!(rule(None, &[], &[]).is_none());
        assert!(rule(Some("  "), &[], &[]).is_none());
    }
}
