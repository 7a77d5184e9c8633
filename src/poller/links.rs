// src/poller/links.rs
//! Link-list feeds: a listing page whose items are addressed by their link.
//!
//! Unlike numbered feeds there is no watermark. Each item's link is checked
//! against the [`SeenSet`]; matching items are recorded there before they are
//! queued, so a crash after recording loses at most one delivery and never
//! repeats one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::fetch::{classify, normalize_text};
use crate::dispatch::{announcement_text, DispatchQueue, Payload};
use crate::error::{FetchError, TickAbort};
use crate::rules::{LinkListSource, Rule, RuleEngine};
use crate::schedule::ActiveHours;
use crate::seen::SeenSet;

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkItem {
    pub title: String,
    pub time: Option<String>,
    /// Absolute URL; the dedup key.
    pub link: String,
}

#[async_trait]
pub trait LinkListFetcher: Send + Sync {
    /// Items in page order (newest first on most listings).
    async fn fetch_list(&self) -> Result<Vec<LinkItem>, FetchError>;
}

static RE_ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
        .expect("anchor regex")
});
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex"));

/// Pull items out of a listing page.
///
/// Only anchors whose `href` starts with `prefix` count (all anchors when
/// `None`). The first text run inside the anchor is the title, the second one
/// (if any) the time. Relative links are resolved against `base`; duplicates
/// keep their first position.
pub fn parse_listing(html: &str, base: &Url, prefix: Option<&str>) -> Vec<LinkItem> {
    let mut out: Vec<LinkItem> = Vec::new();
    for cap in RE_ANCHOR.captures_iter(html) {
        let href = html_escape::decode_html_entities(cap[1].trim()).to_string();
        if prefix.is_some_and(|p| !href.starts_with(p)) {
            continue;
        }
        let Ok(link) = base.join(&href) else {
            debug!(%href, "skipping unparsable link");
            continue;
        };

        let mut runs = RE_TAG
            .split(&cap[2])
            .map(normalize_text)
            .filter(|t| !t.is_empty());
        let Some(title) = runs.next() else {
            continue;
        };
        let time = runs.next();

        let link = link.to_string();
        if out.iter().any(|i| i.link == link) {
            continue;
        }
        out.push(LinkItem { title, time, link });
    }
    out
}

/// GETs the listing URL and parses anchors out of the HTML.
#[derive(Clone)]
pub struct HttpLinkListFetcher {
    url: Url,
    prefix: Option<String>,
    client: reqwest::Client,
}

impl HttpLinkListFetcher {
    pub fn new(source: &LinkListSource, timeout: Duration) -> Result<Self, FetchError> {
        let url = Url::parse(&source.listing_url)
            .map_err(|e| FetchError::Transport(format!("{}: {e}", source.listing_url)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("announce-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Ok(Self {
            url,
            prefix: source.link_prefix.clone(),
            client,
        })
    }
}

#[async_trait]
impl LinkListFetcher for HttpLinkListFetcher {
    async fn fetch_list(&self) -> Result<Vec<LinkItem>, FetchError> {
        let rsp = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| classify(&e))?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(FetchError::Transport(format!("{}: HTTP {status}", self.url)));
        }
        let body = rsp
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("{}: body: {e}", self.url)))?;
        Ok(parse_listing(&body, &self.url, self.prefix.as_deref()))
    }
}

/// Poller for one `link-list-feed` rule.
pub struct LinkListPoller {
    rule: String,
    label: String,
    interval: Duration,
    fetcher: Arc<dyn LinkListFetcher>,
    engine: RuleEngine,
    queue: DispatchQueue,
    seen: Arc<Mutex<SeenSet>>,
    fetch_timeout: Duration,
    active_hours: Option<ActiveHours>,
}

impl LinkListPoller {
    pub fn new(
        rule: &Rule,
        source: &LinkListSource,
        fetcher: Arc<dyn LinkListFetcher>,
        engine: RuleEngine,
        queue: DispatchQueue,
        seen: Arc<Mutex<SeenSet>>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            rule: rule.name.clone(),
            label: rule.provenance_label().to_string(),
            interval: source.poll_interval,
            fetcher,
            engine,
            queue,
            seen,
            fetch_timeout,
            active_hours: None,
        }
    }

    pub fn with_active_hours(mut self, hours: Option<ActiveHours>) -> Self {
        self.active_hours = hours;
        self
    }

    /// Fetch the listing once and queue every new matching item.
    /// Returns how many items were queued.
    pub async fn tick(&self) -> Result<usize, TickAbort> {
        if let Some(hours) = self.active_hours {
            if !hours.is_active_now() {
                info!(rule = %self.rule, "outside active hours, skipping tick");
                return Ok(0);
            }
        }
        counter!("poller_ticks_total", "rule" => self.rule.clone()).increment(1);

        let abort = |reason: String| {
            counter!("poller_tick_aborts_total", "rule" => self.rule.clone()).increment(1);
            TickAbort {
                rule: self.rule.clone(),
                reason,
            }
        };
        let items = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch_list())
            .await
            .unwrap_or(Err(FetchError::Timeout(self.fetch_timeout)))
            .map_err(|e| abort(e.to_string()))?;
        debug!(rule = %self.rule, items = items.len(), "listing fetched");

        let mut queued = 0;
        // oldest first
        for item in items.iter().rev() {
            let Some(route) = self.engine.route_feed_item(&self.rule, &item.title) else {
                continue;
            };
            {
                let mut seen = self.seen.lock().await;
                if seen.has(&self.rule, &item.link) {
                    continue;
                }
                if let Err(e) = seen.record(&self.rule, &item.link) {
                    // without a record the item would repeat after a restart
                    error!(rule = %self.rule, link = %item.link, error = %e, "failed to record link, skipping item");
                    continue;
                }
            }
            counter!("poller_hits_total", "rule" => self.rule.clone()).increment(1);
            info!(rule = %self.rule, title = %item.title, link = %item.link, "new announcement");

            let text = announcement_text(&item.title, item.time.as_deref(), &item.link);
            self.queue
                .submit(&route.destinations, Payload::text(text), &self.label)
                .await;
            queued += 1;
        }
        Ok(queued)
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(rule = %self.rule, every = ?self.interval, "link-list poller started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(abort) = self.tick().await {
                    warn!(error = %abort, "tick aborted");
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!(rule = %self.rule, "link-list poller stopped");
        })
    }
}
