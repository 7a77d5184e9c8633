// src/rules/filter.rs
//! Filter predicates. Compiled once at load so matching never fails.

use regex::Regex;

use crate::rules::Destination;

#[derive(Debug, Clone)]
pub enum FilterKind {
    MatchAll,
    /// Lowercased, non-empty keywords.
    KeywordAny(Vec<String>),
    Regex(Regex),
}

/// A filter plus an optional destination list that overrides the rule's own
/// when this filter is the one that wins.
#[derive(Debug, Clone)]
pub struct Filter {
    pub kind: FilterKind,
    pub destinations: Option<Vec<Destination>>,
}

impl Filter {
    pub fn match_all() -> Self {
        Self {
            kind: FilterKind::MatchAll,
            destinations: None,
        }
    }

    pub fn keyword_any<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            kind: FilterKind::KeywordAny(keywords),
            destinations: None,
        }
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            kind: FilterKind::Regex(Regex::new(pattern)?),
            destinations: None,
        })
    }

    pub fn with_destinations(mut self, destinations: Vec<Destination>) -> Self {
        self.destinations = Some(destinations);
        self
    }
}

/// Pure predicate: does `text` pass `filter`?
pub fn matches(text: &str, filter: &Filter) -> bool {
    match &filter.kind {
        FilterKind::MatchAll => true,
        FilterKind::KeywordAny(keywords) => {
            if keywords.is_empty() {
                return false;
            }
            let lowered = text.to_lowercase();
            keywords.iter().any(|k| lowered.contains(k.as_str()))
        }
        FilterKind::Regex(re) => re.is_match(text),
    }
}
