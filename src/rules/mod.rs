// src/rules/mod.rs
//! Routing rule model: where an item comes from, which filters it must pass,
//! and where it is copied to. Built once from the config file by
//! [`crate::config::load_routing_table`] and shared read-only afterwards.

pub mod engine;
pub mod filter;

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

pub use engine::{merge_destinations, resolve, Route, RuleEngine};
pub use filter::{matches, Filter, FilterKind};

/// Chat identity as used by the chat platforms (Telegram ids are negative for channels).
pub type ChatId = i64;

/// Where a matched item is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Destination {
    ChatChannel { target_id: i64 },
    ChatGroup { target_id: i64 },
}

impl Destination {
    pub fn target_id(&self) -> i64 {
        match self {
            Destination::ChatChannel { target_id } | Destination::ChatGroup { target_id } => {
                *target_id
            }
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::ChatChannel { target_id } => write!(f, "chat-channel:{target_id}"),
            Destination::ChatGroup { target_id } => write!(f, "chat-group:{target_id}"),
        }
    }
}

/// Numbered feed probed upward from a watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdSequenceSource {
    /// URL with an `{id}` placeholder.
    pub base_url_template: String,
    /// Last confirmed id. Probing starts at `start_id + 1`.
    pub start_id: u64,
    pub poll_interval: Duration,
    pub consecutive_miss_limit: u32,
}

impl IdSequenceSource {
    pub fn url_for(&self, id: u64) -> String {
        self.base_url_template.replace("{id}", &id.to_string())
    }
}

/// Listing page whose items are addressed by link and deduplicated through the seen-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkListSource {
    pub listing_url: String,
    /// Only anchors whose href starts with this prefix are items.
    pub link_prefix: Option<String>,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    ChatFeed { identities: BTreeSet<ChatId> },
    IdSequenceFeed(IdSequenceSource),
    LinkListFeed(LinkListSource),
}

impl Source {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Source::ChatFeed { .. } => "chat-feed",
            Source::IdSequenceFeed(_) => "id-sequence-feed",
            Source::LinkListFeed(_) => "link-list-feed",
        }
    }

    pub fn accepts_chat(&self, identity: ChatId) -> bool {
        matches!(self, Source::ChatFeed { identities } if identities.contains(&identity))
    }
}

/// One routing rule. `name` keys the persisted watermark, so renaming a rule
/// starts its cursor over from the configured `start_id`.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    /// Provenance label for feed rules. Chat rules use the chat title instead.
    pub label: Option<String>,
    pub source: Source,
    pub filters: Vec<Filter>,
    pub destinations: Vec<Destination>,
}

impl Rule {
    pub fn provenance_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// All rules in declared order.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    pub rules: Vec<Rule>,
}

impl RoutingTable {
    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn id_sequence_rules(&self) -> impl Iterator<Item = (&Rule, &IdSequenceSource)> {
        self.rules.iter().filter_map(|r| match &r.source {
            Source::IdSequenceFeed(s) => Some((r, s)),
            _ => None,
        })
    }

    pub fn link_list_rules(&self) -> impl Iterator<Item = (&Rule, &LinkListSource)> {
        self.rules.iter().filter_map(|r| match &r.source {
            Source::LinkListFeed(s) => Some((r, s)),
            _ => None,
        })
    }

    /// Every chat identity some rule listens to.
    pub fn chat_identities(&self) -> BTreeSet<ChatId> {
        self.rules
            .iter()
            .filter_map(|r| match &r.source {
                Source::ChatFeed { identities } => Some(identities.iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}
