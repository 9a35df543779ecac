//! Which fetched events of a feed are imported.

use regex::{Regex, RegexBuilder};

use crate::db::models::{CalendarFeed, FilterTarget, MatchMode, SyncApproach, SyncFilterRule};
use crate::services::fetcher::ExternalEventInstance;

/// A filter rule with its pattern prepared for matching.
#[derive(Debug)]
pub struct CompiledRule {
    target: FilterTarget,
    matcher: PatternMatcher,
}

#[derive(Debug)]
enum PatternMatcher {
    Text { mode: MatchMode, needle: String },
    Regex(Regex),
    /// Pattern that failed to compile; never matches.
    Invalid,
}

impl CompiledRule {
    fn compile(rule: &SyncFilterRule) -> Self {
        let matcher = match rule.match_mode {
            MatchMode::Regex => match RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
            {
                Ok(re) => PatternMatcher::Regex(re),
                Err(e) => {
                    tracing::warn!(
                        "Filter rule {} has an invalid regex '{}': {}",
                        rule.id,
                        rule.pattern,
                        e
                    );
                    PatternMatcher::Invalid
                }
            },
            mode => PatternMatcher::Text {
                mode,
                needle: rule.pattern.to_lowercase(),
            },
        };
        Self {
            target: rule.target,
            matcher,
        }
    }

    fn matches(&self, event: &ExternalEventInstance) -> bool {
        let value = match self.target {
            FilterTarget::Title => Some(event.title.as_str()),
            FilterTarget::Location => event.location.as_deref(),
            FilterTarget::Description => event.description.as_deref(),
        };
        let Some(value) = value else {
            return false;
        };

        match &self.matcher {
            PatternMatcher::Regex(re) => re.is_match(value),
            PatternMatcher::Invalid => false,
            PatternMatcher::Text { mode, needle } => {
                let value = value.to_lowercase();
                match mode {
                    MatchMode::Contains => value.contains(needle.as_str()),
                    MatchMode::Exact => value == *needle,
                    MatchMode::StartsWith => value.starts_with(needle.as_str()),
                    MatchMode::EndsWith => value.ends_with(needle.as_str()),
                    MatchMode::Regex => false,
                }
            }
        }
    }
}

/// The import decision for one feed, built once per sync.
#[derive(Debug)]
pub enum FilterPolicy {
    /// Every event is imported.
    PassAll,
    /// Mixed calendar with filtering on and no active rules: nothing is imported.
    PassNone,
    /// Events matching at least one rule are imported.
    AnyRule(Vec<CompiledRule>),
}

impl FilterPolicy {
    /// `rules` are the active filter rules of `feed`; ignored unless the feed needs filtering.
    pub fn for_feed(feed: &CalendarFeed, rules: &[SyncFilterRule]) -> Self {
        match feed.sync_approach {
            SyncApproach::YogaOnly => FilterPolicy::PassAll,
            SyncApproach::MixedCalendar if !feed.filtering_enabled => FilterPolicy::PassAll,
            SyncApproach::MixedCalendar => {
                let compiled: Vec<CompiledRule> = rules
                    .iter()
                    .filter(|r| r.is_active)
                    .map(CompiledRule::compile)
                    .collect();
                if compiled.is_empty() {
                    FilterPolicy::PassNone
                } else {
                    FilterPolicy::AnyRule(compiled)
                }
            }
        }
    }

    /// Whether the active filter rules need loading at all for `feed`.
    pub fn needs_rules(feed: &CalendarFeed) -> bool {
        feed.sync_approach == SyncApproach::MixedCalendar && feed.filtering_enabled
    }

    pub fn passes(&self, event: &ExternalEventInstance) -> bool {
        match self {
            FilterPolicy::PassAll => true,
            FilterPolicy::PassNone => false,
            FilterPolicy::AnyRule(rules) => rules.iter().any(|r| r.matches(event)),
        }
    }

    pub fn apply(&self, events: Vec<ExternalEventInstance>) -> Vec<ExternalEventInstance> {
        events.into_iter().filter(|e| self.passes(e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::timezone::WallClock;
    use chrono::{NaiveDate, Utc};

    fn feed(approach: SyncApproach, filtering_enabled: bool) -> CalendarFeed {
        let now = Utc::now().naive_utc();
        CalendarFeed {
            id: "f1".into(),
            user_id: "u1".into(),
            name: None,
            source: "https://example.com/cal.ics".into(),
            sync_approach: approach,
            filtering_enabled,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn rule(target: FilterTarget, mode: MatchMode, pattern: &str) -> SyncFilterRule {
        SyncFilterRule {
            id: format!("r-{pattern}"),
            user_id: "u1".into(),
            feed_id: "f1".into(),
            target,
            match_mode: mode,
            pattern: pattern.into(),
            is_active: true,
        }
    }

    fn event(title: &str, location: Option<&str>) -> ExternalEventInstance {
        let start = NaiveDate::from_ymd_opt(2024, 5, 2)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        ExternalEventInstance {
            uid: title.into(),
            recurrence_id: title.into(),
            start: WallClock::floating(start),
            end: WallClock::floating(start),
            title: title.into(),
            description: None,
            location: location.map(String::from),
            status: "confirmed".into(),
            is_all_day: false,
        }
    }

    #[test]
    fn yoga_only_and_disabled_filtering_pass_everything() {
        let e = event("Dentist", None);
        assert!(FilterPolicy::for_feed(&feed(SyncApproach::YogaOnly, true), &[]).passes(&e));
        assert!(FilterPolicy::for_feed(&feed(SyncApproach::MixedCalendar, false), &[]).passes(&e));
    }

    #[test]
    fn mixed_calendar_without_rules_passes_nothing() {
        let policy = FilterPolicy::for_feed(&feed(SyncApproach::MixedCalendar, true), &[]);
        assert!(matches!(policy, FilterPolicy::PassNone));
        assert!(policy.apply(vec![event("Yoga", None), event("Dentist", None)]).is_empty());

        let mut inactive = rule(FilterTarget::Title, MatchMode::Contains, "yoga");
        inactive.is_active = false;
        let policy = FilterPolicy::for_feed(&feed(SyncApproach::MixedCalendar, true), &[inactive]);
        assert!(matches!(policy, FilterPolicy::PassNone));
    }

    #[test]
    fn text_modes_are_case_insensitive() {
        let mixed = feed(SyncApproach::MixedCalendar, true);
        let cases = [
            (MatchMode::Contains, "YOGA", "Morning yoga flow", true),
            (MatchMode::Exact, "hatha yoga", "Hatha Yoga", true),
            (MatchMode::Exact, "hatha", "Hatha Yoga", false),
            (MatchMode::StartsWith, "yoga:", "Yoga: Vinyasa", true),
            (MatchMode::EndsWith, "(studio)", "Flow (Studio)", true),
            (MatchMode::EndsWith, "studio", "Studio visit", false),
        ];
        for (mode, pattern, title, expected) in cases {
            let policy = FilterPolicy::for_feed(&mixed, &[rule(FilterTarget::Title, mode, pattern)]);
            assert_eq!(policy.passes(&event(title, None)), expected, "{mode:?} {pattern} {title}");
        }
    }

    #[test]
    fn regex_rules_ignore_case_and_invalid_patterns_never_match() {
        let mixed = feed(SyncApproach::MixedCalendar, true);
        let policy = FilterPolicy::for_feed(
            &mixed,
            &[
                rule(FilterTarget::Title, MatchMode::Regex, "(unclosed"),
                rule(FilterTarget::Location, MatchMode::Regex, r"^studio\s+[ab]\b"),
            ],
        );
        assert!(policy.passes(&event("Class", Some("STUDIO B, Main St"))));
        assert!(!policy.passes(&event("(unclosed", Some("Home"))));
        assert!(!policy.passes(&event("Class", None)));
    }
}
