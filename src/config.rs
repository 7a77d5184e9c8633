// src/config.rs
//! Routing table file format, environment settings, and cursor write-back.
//!
//! The routing table is TOML:
//!
//! ```toml
//! [[rules]]
//! name = "exchange-listings"
//! label = "Exchange announcements"
//! source = { kind = "id-sequence-feed", base_url_template = "https://feed.example/article/{id}", start_id = 46000 }
//! filters = [{ kind = "keyword-any", keywords = ["listing", "alpha"] }]
//! destinations = [{ kind = "chat-channel", target_id = 123 }]
//! ```
//!
//! The only field ever written back is `source.start_id`.

use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tempfile::NamedTempFile;
use toml_edit::{DocumentMut, Item, TableLike, Value};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::rules::{
    ChatId, Destination, Filter, IdSequenceSource, LinkListSource, RoutingTable, Rule, Source,
};
use crate::schedule::ActiveHours;

pub const DEFAULT_CONFIG_PATH: &str = "config/relay.toml";
pub const ENV_CONFIG_PATH: &str = "RELAY_CONFIG_PATH";

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_POLL_WINDOW: u32 = 10;
pub const DEFAULT_MISS_LIMIT: u32 = 4;
pub const DEFAULT_SEEN_LINKS_PATH: &str = "state/sent_links.txt";

/* ----------------------------
File schema
---------------------------- */

#[derive(Debug, Clone, Deserialize)]
pub struct RelayFile {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub source: SourceSpec,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SourceSpec {
    ChatFeed {
        identities: Vec<ChatId>,
    },
    IdSequenceFeed {
        base_url_template: String,
        start_id: u64,
        #[serde(default)]
        poll_interval_secs: Option<u64>,
        #[serde(default)]
        consecutive_miss_limit: Option<u32>,
    },
    LinkListFeed {
        listing_url: String,
        #[serde(default)]
        link_prefix: Option<String>,
        #[serde(default)]
        poll_interval_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FilterSpec {
    MatchAll {
        #[serde(default)]
        destinations: Option<Vec<Destination>>,
    },
    KeywordAny {
        keywords: Vec<String>,
        #[serde(default)]
        destinations: Option<Vec<Destination>>,
    },
    Regex {
        pattern: String,
        #[serde(default)]
        destinations: Option<Vec<Destination>>,
    },
}

/* ----------------------------
Environment settings
---------------------------- */

/// Process-wide knobs read from the environment (after `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub poll_window: u32,
    pub default_miss_limit: u32,
    pub active_hours: Option<ActiveHours>,
    pub seen_links_path: PathBuf,
    pub fetch_timeout: Duration,
    pub send_timeout: Duration,
    pub shutdown_grace: Duration,
    pub diag_addr: Option<String>,
    pub discord_bot_token: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_staging_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            poll_window: DEFAULT_POLL_WINDOW,
            default_miss_limit: DEFAULT_MISS_LIMIT,
            active_hours: None,
            seen_links_path: PathBuf::from(DEFAULT_SEEN_LINKS_PATH),
            fetch_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(15),
            diag_addr: None,
            discord_bot_token: None,
            telegram_bot_token: None,
            telegram_staging_dir: std::env::temp_dir().join("announce-relay"),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let active_hours = match env_nonempty("ACTIVE_HOURS") {
            Some(raw) => Some(raw.parse::<ActiveHours>().map_err(|message| {
                ConfigError::InvalidValue {
                    key: "ACTIVE_HOURS".into(),
                    message,
                }
            })?),
            None => None,
        };

        let settings = Self {
            config_path: env_nonempty(ENV_CONFIG_PATH)
                .map(PathBuf::from)
                .unwrap_or(d.config_path),
            poll_window: env_parse("POLL_WINDOW", d.poll_window)?,
            default_miss_limit: env_parse("CONSECUTIVE_MISS_LIMIT", d.default_miss_limit)?,
            active_hours,
            seen_links_path: env_nonempty("SEEN_LINKS_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.seen_links_path),
            fetch_timeout: Duration::from_secs(env_parse("FETCH_TIMEOUT_SECS", 10u64)?),
            send_timeout: Duration::from_secs(env_parse("SEND_TIMEOUT_SECS", 30u64)?),
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 15u64)?),
            diag_addr: env_nonempty("DIAG_ADDR"),
            discord_bot_token: env_nonempty("DISCORD_BOT_TOKEN"),
            telegram_bot_token: env_nonempty("TELEGRAM_BOT_TOKEN"),
            telegram_staging_dir: env_nonempty("TELEGRAM_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.telegram_staging_dir),
        };

        if settings.poll_window == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POLL_WINDOW".into(),
                message: "must be at least 1".into(),
            });
        }
        if settings.default_miss_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONSECUTIVE_MISS_LIMIT".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(settings)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_nonempty(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

/* ----------------------------
Loading + validation
---------------------------- */

pub fn load_routing_table(path: &Path, settings: &Settings) -> Result<RoutingTable, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let table = parse_routing_table(&content, settings)?;
    info!(
        path = %path.display(),
        rules = table.rules.len(),
        "routing table loaded"
    );
    Ok(table)
}

pub fn parse_routing_table(content: &str, settings: &Settings) -> Result<RoutingTable, ConfigError> {
    let file: RelayFile = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    compile_table(file, settings)
}

pub fn compile_table(file: RelayFile, settings: &Settings) -> Result<RoutingTable, ConfigError> {
    let mut names = HashSet::new();
    let mut rules = Vec::with_capacity(file.rules.len());
    for spec in file.rules {
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::MissingField {
                rule: "<unnamed>".into(),
                field: "name".into(),
            });
        }
        if !names.insert(name.clone()) {
            return Err(ConfigError::DuplicateRule(name));
        }
        rules.push(compile_rule(name, spec, settings)?);
    }
    Ok(RoutingTable { rules })
}

fn compile_rule(name: String, spec: RuleSpec, settings: &Settings) -> Result<Rule, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidRule {
        rule: name.clone(),
        message: message.to_string(),
    };

    let source = match spec.source {
        SourceSpec::ChatFeed { identities } => {
            if identities.is_empty() {
                return Err(invalid("chat-feed source needs at least one identity"));
            }
            Source::ChatFeed {
                identities: identities.into_iter().collect(),
            }
        }
        SourceSpec::IdSequenceFeed {
            base_url_template,
            start_id,
            poll_interval_secs,
            consecutive_miss_limit,
        } => {
            if !base_url_template.contains("{id}") {
                return Err(invalid("base_url_template must contain an {id} placeholder"));
            }
            let consecutive_miss_limit =
                consecutive_miss_limit.unwrap_or(settings.default_miss_limit);
            if consecutive_miss_limit == 0 {
                return Err(invalid("consecutive_miss_limit must be at least 1"));
            }
            Source::IdSequenceFeed(IdSequenceSource {
                base_url_template,
                start_id,
                poll_interval: poll_interval(&name, poll_interval_secs)?,
                consecutive_miss_limit,
            })
        }
        SourceSpec::LinkListFeed {
            listing_url,
            link_prefix,
            poll_interval_secs,
        } => {
            if listing_url.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    rule: name.clone(),
                    field: "source.listing_url".into(),
                });
            }
            Source::LinkListFeed(LinkListSource {
                listing_url,
                link_prefix: link_prefix.filter(|p| !p.is_empty()),
                poll_interval: poll_interval(&name, poll_interval_secs)?,
            })
        }
    };

    let filters = spec
        .filters
        .into_iter()
        .map(|f| compile_filter(&name, f))
        .collect::<Result<Vec<_>, _>>()?;

    let has_filter_destinations = filters.iter().any(|f| f.destinations.is_some());
    if spec.destinations.is_empty() && !has_filter_destinations {
        return Err(ConfigError::MissingField {
            rule: name,
            field: "destinations".into(),
        });
    }

    debug!(rule = %name, kind = source.kind_name(), filters = filters.len(), "rule compiled");
    Ok(Rule {
        name,
        label: spec.label.filter(|l| !l.trim().is_empty()),
        source,
        filters,
        destinations: spec.destinations,
    })
}

fn poll_interval(rule: &str, secs: Option<u64>) -> Result<Duration, ConfigError> {
    let secs = secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    if secs == 0 {
        return Err(ConfigError::InvalidRule {
            rule: rule.to_string(),
            message: "poll_interval_secs must be at least 1".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn compile_filter(rule: &str, spec: FilterSpec) -> Result<Filter, ConfigError> {
    let (filter, destinations) = match spec {
        FilterSpec::MatchAll { destinations } => (Filter::match_all(), destinations),
        FilterSpec::KeywordAny {
            keywords,
            destinations,
        } => (Filter::keyword_any(keywords), destinations),
        FilterSpec::Regex {
            pattern,
            destinations,
        } => {
            let f = Filter::regex(&pattern).map_err(|e| ConfigError::InvalidRegex {
                rule: rule.to_string(),
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            (f, destinations)
        }
    };
    Ok(match destinations {
        Some(d) => filter.with_destinations(d),
        None => filter,
    })
}

/* ----------------------------
Cursor write-back
---------------------------- */

/// Writes advanced cursors back into the routing table file.
///
/// Every write re-reads the file, patches one rule's `source.start_id` and
/// replaces the whole file through a temp file + rename. The internal lock
/// serializes write-backs from all pollers sharing the file.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `start_id` for `rule`. A value not above the stored one is left alone.
    pub fn persist_start_id(&self, rule: &str, start_id: u64) -> Result<(), ConfigError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let content = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        let Some(patched) = patch_start_id(&content, rule, start_id)? else {
            debug!(rule, start_id, "stored start_id already current");
            return Ok(());
        };
        write_atomically(&self.path, &patched)?;
        info!(rule, start_id, path = %self.path.display(), "cursor persisted");
        Ok(())
    }

    /// Same as [`Self::persist_start_id`], off the async runtime.
    pub async fn persist_start_id_async(
        self: &Arc<Self>,
        rule: &str,
        start_id: u64,
    ) -> Result<(), ConfigError> {
        let store = Arc::clone(self);
        let rule = rule.to_string();
        tokio::task::spawn_blocking(move || store.persist_start_id(&rule, start_id))
            .await
            .map_err(|e| ConfigError::Write(std::io::Error::other(e.to_string())))?
    }
}

/// Returns the new file content, or `None` when nothing needs writing.
///
/// Only the `start_id` value is rewritten; comments, key order and inline
/// tables elsewhere in the file are kept as they are.
pub fn patch_start_id(content: &str, rule: &str, start_id: u64) -> Result<Option<String>, ConfigError> {
    let mut doc: DocumentMut = content
        .parse()
        .map_err(|e: toml_edit::TomlError| ConfigError::Parse(e.to_string()))?;

    let new_value = i64::try_from(start_id).map_err(|_| ConfigError::InvalidValue {
        key: format!("{rule}.source.start_id"),
        message: format!("{start_id} does not fit a TOML integer"),
    })?;

    let source =
        rule_source_mut(&mut doc, rule).ok_or_else(|| ConfigError::UnknownRule(rule.to_string()))?;

    match source.get_mut("start_id").and_then(Item::as_value_mut) {
        Some(current) => {
            if current.as_integer().is_some_and(|c| c >= new_value) {
                return Ok(None);
            }
            let decor = current.decor().clone();
            *current = Value::from(new_value);
            *current.decor_mut() = decor;
        }
        None => {
            source.insert("start_id", toml_edit::value(new_value));
        }
    }
    Ok(Some(doc.to_string()))
}

/// `source` table of the rule named `rule`, written either as `[[rules]]`
/// sections or as an inline array.
fn rule_source_mut<'a>(doc: &'a mut DocumentMut, rule: &str) -> Option<&'a mut dyn TableLike> {
    let is_named = |name: Option<&str>| name.is_some_and(|n| n.trim() == rule);
    let entry: &mut dyn TableLike = match doc.get_mut("rules")? {
        Item::ArrayOfTables(tables) => tables
            .iter_mut()
            .find(|t| is_named(t.get("name").and_then(Item::as_str)))?,
        Item::Value(Value::Array(rules)) => rules
            .iter_mut()
            .filter_map(Value::as_inline_table_mut)
            .find(|t| is_named(t.get("name").and_then(Value::as_str)))?,
        _ => return None,
    };
    entry.get_mut("source")?.as_table_like_mut()
}

fn write_atomically(target: &Path, content: &str) -> Result<(), ConfigError> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(target).map_err(|e| ConfigError::Write(e.error))?;
    Ok(())
}
