// src/rules/engine.rs
//! Rule resolution: source selection first, then the first matching filter wins.

use std::sync::Arc;

use tracing::debug;

use crate::rules::{filter::matches, ChatId, Destination, RoutingTable, Rule};

/// Destinations for `text` under `rule`.
///
/// Filters are evaluated in declared order and the first match decides; later
/// filters are not consulted. The winning filter's own destinations take
/// precedence over the rule's list when it declares any. No match yields an
/// empty list.
pub fn resolve(rule: &Rule, text: &str) -> Vec<Destination> {
    for (idx, filter) in rule.filters.iter().enumerate() {
        if matches(text, filter) {
            debug!(rule = %rule.name, filter = idx, "filter matched");
            return filter
                .destinations
                .clone()
                .unwrap_or_else(|| rule.destinations.clone());
        }
    }
    Vec::new()
}

/// One rule's verdict for an inbound item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub rule: String,
    pub destinations: Vec<Destination>,
}

/// Read-only view over the routing table.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    table: Arc<RoutingTable>,
}

impl RuleEngine {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Routes for a chat message from `identity`. Only rules whose chat source
    /// lists the identity are consulted; rules with no matching filter are omitted.
    pub fn route_chat(&self, identity: ChatId, text: &str) -> Vec<Route> {
        self.table
            .rules
            .iter()
            .filter(|r| r.source.accepts_chat(identity))
            .filter_map(|r| {
                let destinations = resolve(r, text);
                (!destinations.is_empty()).then(|| Route {
                    rule: r.name.clone(),
                    destinations,
                })
            })
            .collect()
    }

    /// Route for an item produced by the feed behind `rule_name`.
    pub fn route_feed_item(&self, rule_name: &str, title: &str) -> Option<Route> {
        let rule = self.table.get(rule_name)?;
        let destinations = resolve(rule, title);
        (!destinations.is_empty()).then(|| Route {
            rule: rule.name.clone(),
            destinations,
        })
    }
}

/// Flatten several routes into one destination list, first occurrence wins,
/// so a destination named by two rules receives the message once.
pub fn merge_destinations(routes: &[Route]) -> Vec<Destination> {
    let mut out: Vec<Destination> = Vec::new();
    for d in routes.iter().flat_map(|r| r.destinations.iter()) {
        if !out.contains(d) {
            out.push(*d);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Filter, Source};

    const A: Destination = Destination::ChatChannel { target_id: 1 };
    const B: Destination = Destination::ChatChannel { target_id: 2 };

    fn chat_rule(name: &str, ids: &[ChatId], filters: Vec<Filter>, dests: Vec<Destination>) -> Rule {
        Rule {
            name: name.into(),
            label: None,
            source: Source::ChatFeed {
                identities: ids.iter().copied().collect(),
            },
            filters,
            destinations: dests,
        }
    }

    #[test]
    fn first_matching_filter_wins_without_union() {
        let rule = chat_rule(
            "r",
            &[1],
            vec![
                Filter::keyword_any(["space"]).with_destinations(vec![A]),
                Filter::match_all().with_destinations(vec![B]),
            ],
            vec![],
        );
        assert_eq!(resolve(&rule, "a space trip"), vec![A]);
        assert_eq!(resolve(&rule, "a sea trip"), vec![B]);
    }

    #[test]
    fn winning_filter_returns_rule_destinations_verbatim() {
        let rule = chat_rule(
            "r",
            &[1],
            vec![Filter::keyword_any(["usd"]), Filter::match_all()],
            vec![B, A, B],
        );
        assert_eq!(resolve(&rule, "USD"), vec![B, A, B]);
    }

    #[test]
    fn no_match_returns_empty() {
        let rule = chat_rule("r", &[1], vec![Filter::keyword_any(["btc"])], vec![A]);
        assert!(resolve(&rule, "eth only").is_empty());

        let no_filters = chat_rule("r", &[1], vec![], vec![A]);
        assert!(resolve(&no_filters, "anything").is_empty());
    }

    #[test]
    fn route_chat_skips_rules_for_other_identities() {
        let table = RoutingTable {
            rules: vec![
                chat_rule("one", &[100], vec![Filter::match_all()], vec![A]),
                chat_rule("two", &[200], vec![Filter::match_all()], vec![B]),
            ],
        };
        let engine = RuleEngine::new(Arc::new(table));
        let routes = engine.route_chat(100, "hello");
        assert_eq!(
            routes,
            vec![Route {
                rule: "one".into(),
                destinations: vec![A]
            }]
        );
        assert!(engine.route_chat(300, "hello").is_empty());
    }

    #[test]
    fn merged_destinations_are_deduplicated_in_order() {
        let routes = vec![
            Route {
                rule: "x".into(),
                destinations: vec![B, A],
            },
            Route {
                rule: "y".into(),
                destinations: vec![A],
            },
        ];
        assert_eq!(merge_destinations(&routes), vec![B, A]);
    }
}
