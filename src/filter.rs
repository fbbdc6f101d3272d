use crate::backend::Predicate;
use crate::content::ContentItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use strum::Display;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterResult {
    Pass,
    Reject(Filter),
}

#[derive(Debug, Clone, PartialEq, Display)]
pub enum Filter {
    #[strum(serialize = "draft")]
    Draft,
    #[strum(serialize = "inactive")]
    Inactive,
    #[strum(serialize = "category")]
    Category,
    #[strum(serialize = "mood")]
    Mood,
}

/// Active tag constraints for a view. Each non-empty set must be satisfied
/// (AND across sets); within a set any listed value is enough (OR).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSelection {
    pub categories: BTreeSet<String>,
    pub moods: BTreeSet<String>,
}

fn parse_param(value: Option<&str>) -> BTreeSet<String> {
    value
        .into_iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("all"))
        .map(str::to_string)
        .collect()
}

impl FilterSelection {
    pub fn any() -> Self {
        Self::default()
    }

    /// Builds a selection from query-style parameters. Missing, empty and
    /// `all` values mean "no constraint"; commas separate alternatives.
    pub fn from_params(category: Option<&str>, mood: Option<&str>) -> Self {
        Self {
            categories: parse_param(category),
            moods: parse_param(mood),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.insert(category.into());
        self
    }

    pub fn with_mood(mut self, mood: impl Into<String>) -> Self {
        self.moods.insert(mood.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.moods.is_empty()
    }

    /// True when every item passing `self` also passes `base`.
    pub fn narrows(&self, base: &FilterSelection) -> bool {
        let within = |mine: &BTreeSet<String>, theirs: &BTreeSet<String>| {
            theirs.is_empty() || (!mine.is_empty() && mine.is_subset(theirs))
        };
        within(&self.categories, &base.categories) && within(&self.moods, &base.moods)
    }

    pub fn predicates(&self) -> Vec<Predicate> {
        let mut predicates = Vec::new();
        if !self.categories.is_empty() {
            predicates.push(Predicate::In(
                "category".to_string(),
                self.categories.iter().cloned().map(Value::String).collect(),
            ));
        }
        if !self.moods.is_empty() {
            predicates.push(Predicate::Overlaps(
                "tags".to_string(),
                self.moods.iter().cloned().collect(),
            ));
        }
        predicates
    }
}

pub fn apply_filter(item: &ContentItem, filter: &FilterSelection) -> FilterResult {
    if item.is_draft {
        return FilterResult::Reject(Filter::Draft);
    }

    if !item.is_active {
        return FilterResult::Reject(Filter::Inactive);
    }

    if !filter.categories.is_empty() {
        let in_category = item
            .category
            .as_ref()
            .is_some_and(|c| filter.categories.contains(c));
        if !in_category {
            return FilterResult::Reject(Filter::Category);
        }
    }

    if !filter.moods.is_empty() && item.tags.is_disjoint(&filter.moods) {
        return FilterResult::Reject(Filter::Mood);
    }

    FilterResult::Pass
}

pub fn passes(item: &ContentItem, filter: &FilterSelection) -> bool {
    apply_filter(item, filter) == FilterResult::Pass
}

/// The visible subset of `items` under `filter`, in list order.
pub fn visible(items: &[ContentItem], filter: &FilterSelection) -> Vec<ContentItem> {
    items
        .iter()
        .filter(|item| passes(item, filter))
        .cloned()
        .collect()
}
