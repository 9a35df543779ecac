//! Tag and studio classification of events from user-defined keyword rules.

use std::collections::{BTreeSet, HashMap};

use crate::db::models::{StudioPattern, TagRule, TagRuleKind};

/// Lowercased `title + description`, the text content keywords are searched in.
pub fn event_content(title: &str, description: Option<&str>) -> String {
    let mut content = title.to_lowercase();
    if let Some(description) = description {
        content.push(' ');
        content.push_str(&description.to_lowercase());
    }
    content
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| {
        let needle = needle.trim().to_lowercase();
        !needle.is_empty() && haystack.contains(&needle)
    })
}

/// Whether `rule` matches the given lowercased content and raw location.
pub fn rule_matches(rule: &TagRule, content: &str, location: Option<&str>) -> bool {
    match &rule.kind {
        TagRuleKind::LegacyKeyword { keyword } => contains_any(content, std::slice::from_ref(keyword)),
        TagRuleKind::KeywordLists {
            keywords,
            location_keywords,
        } => {
            if contains_any(content, keywords) {
                return true;
            }
            location
                .map(|loc| contains_any(&loc.to_lowercase(), location_keywords))
                .unwrap_or(false)
        }
    }
}

/// A user's rule set, loaded once and applied to any number of events.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    tag_rules: Vec<TagRule>,
    tag_slugs: HashMap<String, String>,
    studios: Vec<StudioPattern>,
}

impl Matcher {
    pub fn new(
        tag_rules: Vec<TagRule>,
        tag_slugs: HashMap<String, String>,
        studios: Vec<StudioPattern>,
    ) -> Self {
        Self {
            tag_rules,
            tag_slugs,
            studios,
        }
    }

    /// Slugs of every tag whose rule matches, sorted and deduplicated.
    ///
    /// Rules pointing at a tag that no longer exists contribute nothing.
    pub fn match_tags(&self, content: &str, location: Option<&str>) -> Vec<String> {
        let slugs: BTreeSet<&str> = self
            .tag_rules
            .iter()
            .filter(|rule| rule_matches(rule, content, location))
            .filter_map(|rule| self.tag_slugs.get(&rule.tag_id).map(String::as_str))
            .collect();
        slugs.into_iter().map(String::from).collect()
    }

    /// First studio, in stored order, with a pattern found in `location`.
    pub fn match_studio(&self, location: Option<&str>) -> Option<String> {
        let location = location?.trim().to_lowercase();
        if location.is_empty() {
            return None;
        }
        self.studios
            .iter()
            .find(|studio| contains_any(&location, &studio.patterns))
            .map(|studio| studio.studio_id.clone())
    }
}
