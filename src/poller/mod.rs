// src/poller/mod.rs
//! Watermark poller: turns a numbered resource space into a stream of new items.
//!
//! Per tick the poller probes `cursor+1 ..= cursor+window` in ascending order,
//! stops early after `consecutive_miss_limit` misses in a row, and commits the
//! highest id that was actually found. The in-memory cursor is advanced first
//! and the config file second, so a crash in between causes a re-probe on the
//! next run, never a skipped id.

pub mod cursor;
pub mod fetch;
pub mod links;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, Unit};
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::dispatch::{announcement_text, DispatchQueue, Payload};
use crate::error::{FetchError, TickAbort};
use crate::rules::{IdSequenceSource, Rule, RuleEngine};
use crate::schedule::ActiveHours;

pub use cursor::CursorBoard;
pub use fetch::{FeedFetcher, FeedItem, HttpFeedFetcher};
pub use links::{HttpLinkListFetcher, LinkItem, LinkListFetcher, LinkListPoller};

/// Multiplier cap for the back-off after aborted ticks.
const MAX_BACKOFF_FACTOR: u32 = 8;

fn describe_metrics() {
    describe_counter!("poller_ticks_total", "Poller ticks run.");
    describe_counter!("poller_hits_total", "Probed ids that existed.");
    describe_counter!("poller_misses_total", "Probed ids that did not exist or failed.");
    describe_counter!("poller_tick_aborts_total", "Ticks abandoned without a cursor change.");
    describe_counter!("poller_fetch_errors_total", "Feed fetch transport errors.");
    describe_histogram!("poller_fetch_ms", Unit::Milliseconds, "Feed fetch latency.");
    describe_gauge!("poller_cursor", "Last confirmed id per rule.");
}

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(describe_metrics);
}

/// Result of probing one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Found items, ascending by id.
    pub items: Vec<FeedItem>,
    /// Highest id found, or the starting cursor when nothing was found.
    pub cursor: u64,
    /// Ids actually requested, in order.
    pub probed: Vec<u64>,
}

/// Probe ids above `cursor` for one tick.
///
/// Not-found ids, per-id transport errors and timeouts all count as misses.
/// [`FetchError::Unreachable`] aborts the tick and discards what was found.
pub async fn probe_window(
    fetcher: &dyn FeedFetcher,
    cursor: u64,
    window: u32,
    miss_limit: u32,
    fetch_timeout: Duration,
) -> Result<ProbeOutcome, FetchError> {
    let mut items = Vec::new();
    let mut probed = Vec::new();
    let mut best = cursor;
    let mut misses: u32 = 0;

    for id in (cursor + 1)..=(cursor + u64::from(window)) {
        probed.push(id);
        let res = tokio::time::timeout(fetch_timeout, fetcher.fetch(id))
            .await
            .unwrap_or(Err(FetchError::Timeout(fetch_timeout)));

        match res {
            Ok(Some(item)) => {
                debug!(id, title = %item.title, "probe hit");
                misses = 0;
                best = id;
                items.push(item);
            }
            Ok(None) => {
                debug!(id, "probe miss");
                misses += 1;
            }
            Err(FetchError::Unreachable(reason)) => {
                return Err(FetchError::Unreachable(reason));
            }
            Err(e) => {
                warn!(id, kind = "transport", error = %e, "probe failed, counting as miss");
                misses += 1;
            }
        }

        if misses >= miss_limit {
            debug!(id, misses, "consecutive miss limit reached");
            break;
        }
    }

    Ok(ProbeOutcome {
        items,
        cursor: best,
        probed,
    })
}

/// What a completed tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    /// Outside the active-hours window.
    Inactive,
    Completed {
        found: usize,
        cursor: u64,
        persisted: bool,
    },
}

/// Poller for one `id-sequence-feed` rule.
pub struct WatermarkPoller {
    rule: String,
    label: String,
    source: IdSequenceSource,
    fetcher: Arc<dyn FeedFetcher>,
    engine: RuleEngine,
    queue: DispatchQueue,
    store: Arc<ConfigStore>,
    cursor: Arc<AtomicU64>,
    persisted: u64,
    window: u32,
    fetch_timeout: Duration,
    active_hours: Option<ActiveHours>,
}

impl WatermarkPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule: &Rule,
        source: IdSequenceSource,
        fetcher: Arc<dyn FeedFetcher>,
        engine: RuleEngine,
        queue: DispatchQueue,
        store: Arc<ConfigStore>,
        cursor: Arc<AtomicU64>,
        window: u32,
        fetch_timeout: Duration,
    ) -> Self {
        let persisted = source.start_id;
        Self {
            rule: rule.name.clone(),
            label: rule.provenance_label().to_string(),
            source,
            fetcher,
            engine,
            queue,
            store,
            cursor,
            persisted,
            window,
            fetch_timeout,
            active_hours: None,
        }
    }

    pub fn with_active_hours(mut self, hours: Option<ActiveHours>) -> Self {
        self.active_hours = hours;
        self
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Run one tick: probe, commit the cursor, persist it, then queue matches.
    pub async fn tick(&mut self) -> Result<TickReport, TickAbort> {
        ensure_metrics_described();
        if let Some(hours) = self.active_hours {
            if !hours.is_active_now() {
                info!(rule = %self.rule, start = hours.start, end = hours.end, "outside active hours, skipping tick");
                return Ok(TickReport::Inactive);
            }
        }
        counter!("poller_ticks_total", "rule" => self.rule.clone()).increment(1);

        let start = self.cursor();
        let outcome = probe_window(
            self.fetcher.as_ref(),
            start,
            self.window,
            self.source.consecutive_miss_limit,
            self.fetch_timeout,
        )
        .await
        .map_err(|e| {
            counter!("poller_tick_aborts_total", "rule" => self.rule.clone()).increment(1);
            TickAbort {
                rule: self.rule.clone(),
                reason: e.to_string(),
            }
        })?;

        let hits = outcome.items.len() as u64;
        counter!("poller_hits_total", "rule" => self.rule.clone()).increment(hits);
        counter!("poller_misses_total", "rule" => self.rule.clone())
            .increment(outcome.probed.len() as u64 - hits);

        let committed = cursor::advance(&self.cursor, outcome.cursor);
        gauge!("poller_cursor", "rule" => self.rule.clone()).set(committed as f64);

        let mut persisted = false;
        if committed > self.persisted {
            match self.store.persist_start_id_async(&self.rule, committed).await {
                Ok(()) => {
                    self.persisted = committed;
                    persisted = true;
                }
                Err(e) => {
                    error!(rule = %self.rule, cursor = committed, error = %e, "cursor write-back failed, will retry next tick");
                }
            }
        }

        debug!(
            rule = %self.rule,
            from = start,
            to = committed,
            probed = outcome.probed.len(),
            found = outcome.items.len(),
            "tick complete"
        );

        for item in &outcome.items {
            self.emit(item).await;
        }

        Ok(TickReport::Completed {
            found: outcome.items.len(),
            cursor: committed,
            persisted,
        })
    }

    async fn emit(&self, item: &FeedItem) {
        let Some(route) = self.engine.route_feed_item(&self.rule, &item.title) else {
            debug!(rule = %self.rule, id = item.id, title = %item.title, "item did not match filters");
            return;
        };
        info!(rule = %self.rule, id = item.id, title = %item.title, "new announcement");
        let text = announcement_text(&item.title, None, &item.url);
        self.queue
            .submit(&route.destinations, Payload::text(text), &self.label)
            .await;
    }

    /// Tick immediately, then every `poll_interval` until shutdown. A running
    /// tick is never interrupted; shutdown is observed between ticks.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.source.poll_interval;
            let mut aborts: u32 = 0;
            info!(rule = %self.rule, cursor = self.cursor(), every = ?interval, "watermark poller started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let delay = match self.tick().await {
                    Ok(_) => {
                        aborts = 0;
                        interval
                    }
                    Err(abort) => {
                        aborts = aborts.saturating_add(1);
                        let factor = 2u32.saturating_pow(aborts - 1).min(MAX_BACKOFF_FACTOR);
                        warn!(error = %abort, retry_in = ?(interval * factor), "tick aborted");
                        interval * factor
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!(rule = %self.rule, cursor = self.cursor(), "watermark poller stopped");
        })
    }
}

/// In-memory fetchers for tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::fetch::{FeedFetcher, FeedItem};
    use crate::error::FetchError;

    #[derive(Default)]
    pub struct ScriptedFeed {
        pub hits: HashSet<u64>,
        pub failing: HashSet<u64>,
        pub unreachable: bool,
        pub calls: Mutex<Vec<u64>>,
    }

    impl ScriptedFeed {
        pub fn with_hits(ids: &[u64]) -> Self {
            Self {
                hits: ids.iter().copied().collect(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<u64> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FeedFetcher for ScriptedFeed {
        async fn fetch(&self, id: u64) -> Result<Option<FeedItem>, FetchError> {
            self.calls.lock().unwrap().push(id);
            if self.unreachable {
                return Err(FetchError::Unreachable("connection refused".into()));
            }
            if self.failing.contains(&id) {
                return Err(FetchError::Transport("reset".into()));
            }
            Ok(self.hits.contains(&id).then(|| FeedItem {
                id,
                title: format!("Announcement {id}"),
                url: format!("https://feed.example/a/{id}"),
            }))
        }
    }

    pub struct ScriptedTitles(pub HashMap<u64, String>);

    impl ScriptedTitles {
        pub fn new(entries: &[(u64, &str)]) -> Self {
            Self(entries.iter().map(|(k, v)| (*k, v.to_string())).collect())
        }
    }

    #[async_trait]
    impl FeedFetcher for ScriptedTitles {
        async fn fetch(&self, id: u64) -> Result<Option<FeedItem>, FetchError> {
            Ok(self.0.get(&id).map(|t| FeedItem {
                id,
                title: t.clone(),
                url: format!("https://feed.example/a/{id}"),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedFeed;
    use super::*;

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn cursor_is_highest_hit_not_window_end() {
        let feed = ScriptedFeed::with_hits(&[22, 24]);
        let out = probe_window(&feed, 20, 10, 4, T).await.unwrap();
        assert_eq!(out.cursor, 24);
        assert_eq!(out.items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![22, 24]);
        // 25..28 are four misses in a row
        assert_eq!(out.probed, (21..=28).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn miss_limit_stops_probing_early() {
        let feed = ScriptedFeed::default();
        let out = probe_window(&feed, 20, 10, 4, T).await.unwrap();
        assert_eq!(feed.calls(), vec![21, 22, 23, 24]);
        assert_eq!(out.cursor, 20);
        assert!(out.items.is_empty());
    }

    #[tokio::test]
    async fn transport_errors_count_as_misses() {
        let feed = ScriptedFeed {
            hits: [21].into_iter().collect(),
            failing: [22, 23].into_iter().collect(),
            ..Default::default()
        };
        let out = probe_window(&feed, 20, 10, 2, T).await.unwrap();
        assert_eq!(out.cursor, 21);
        assert_eq!(out.probed, vec![21, 22, 23]);
    }

    #[tokio::test]
    async fn unreachable_feed_aborts_the_window() {
        let feed = ScriptedFeed {
            unreachable: true,
            ..Default::default()
        };
        let err = probe_window(&feed, 20, 10, 4, T).await.unwrap_err();
        assert!(matches!(err, FetchError::Unreachable(_)));
    }

    #[tokio::test]
    async fn gaps_shorter_than_limit_are_bridged() {
        let feed = ScriptedFeed::with_hits(&[21, 24, 30]);
        let out = probe_window(&feed, 20, 10, 4, T).await.unwrap();
        assert_eq!(out.cursor, 24);
        assert_eq!(out.items.len(), 2);
        assert_eq!(*out.probed.last().unwrap(), 28);
    }

    struct Hanging;

    #[async_trait::async_trait]
    impl FeedFetcher for Hanging {
        async fn fetch(&self, _id: u64) -> Result<Option<FeedItem>, FetchError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_fetch_times_out_as_a_miss() {
        let out = probe_window(&Hanging, 20, 10, 3, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.probed, vec![21, 22, 23]);
        assert_eq!(out.cursor, 20);
        assert!(out.items.is_empty());
    }

    #[test]
    fn fetch_latency_histogram_is_described() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe_metrics();
            metrics::histogram!("poller_fetch_ms").record(12.0);
        });
        let text = handle.render();
        assert!(text.contains("# HELP poller_fetch_ms"), "{text}");
    }

    mod ticks {
        use std::path::PathBuf;

        use super::super::testing::{ScriptedFeed, ScriptedTitles};
        use super::super::*;
        use crate::config::{parse_routing_table, Settings};
        use crate::dispatch::testing::{RecordingSink, Sent};
        use crate::dispatch::{spawn_dispatch_router, Dispatcher};
        use crate::rules::Destination;

        const CONFIG: &str = r#"
[[rules]]
name = "feed"
label = "Exchange"
source = { kind = "id-sequence-feed", base_url_template = "https://feed.example/a/{id}", start_id = 20 }
filters = [{ kind = "keyword-any", keywords = ["listing"] }]
destinations = [{ kind = "chat-channel", target_id = 1 }]
"#;

        struct Harness {
            _dir: tempfile::TempDir,
            path: PathBuf,
            sink: Arc<RecordingSink>,
            router: JoinHandle<()>,
        }

        fn poller(fetcher: Arc<dyn FeedFetcher>) -> (WatermarkPoller, Harness) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("relay.toml");
            std::fs::write(&path, CONFIG).unwrap();

            let table = Arc::new(parse_routing_table(CONFIG, &Settings::default()).unwrap());
            let board = CursorBoard::from_table(&table);
            let (rule, source) = table.id_sequence_rules().next().unwrap();
            let (rule, source) = (rule.clone(), source.clone());

            let sink = Arc::new(RecordingSink::default());
            let (queue, router) = spawn_dispatch_router(Arc::new(Dispatcher::new(
                sink.clone(),
                Duration::from_secs(5),
            )));
            let poller = WatermarkPoller::new(
                &rule,
                source,
                fetcher,
                RuleEngine::new(table),
                queue,
                Arc::new(ConfigStore::new(path.clone())),
                board.cell("feed").unwrap(),
                10,
                Duration::from_secs(5),
            );
            (
                poller,
                Harness {
                    _dir: dir,
                    path,
                    sink,
                    router,
                },
            )
        }

        fn stored_start_id(path: &PathBuf) -> u64 {
            let table =
                parse_routing_table(&std::fs::read_to_string(path).unwrap(), &Settings::default())
                    .unwrap();
            let start_id = table.id_sequence_rules().next().unwrap().1.start_id;
            start_id
        }

        #[tokio::test]
        async fn hits_are_persisted_as_highest_id() {
            let (mut p, h) = poller(Arc::new(ScriptedFeed::with_hits(&[22, 24])));
            let report = p.tick().await.unwrap();
            assert_eq!(
                report,
                TickReport::Completed {
                    found: 2,
                    cursor: 24,
                    persisted: true
                }
            );
            assert_eq!(stored_start_id(&h.path), 24);
        }

        #[tokio::test]
        async fn tick_without_hits_writes_nothing() {
            let (mut p, h) = poller(Arc::new(ScriptedFeed::default()));
            let before = std::fs::read_to_string(&h.path).unwrap();
            let report = p.tick().await.unwrap();
            assert_eq!(
                report,
                TickReport::Completed {
                    found: 0,
                    cursor: 20,
                    persisted: false
                }
            );
            assert_eq!(std::fs::read_to_string(&h.path).unwrap(), before);
        }

        #[tokio::test]
        async fn cursor_never_moves_backwards() {
            let (mut p, h) = poller(Arc::new(ScriptedFeed::with_hits(&[21, 22, 25])));
            p.tick().await.unwrap();
            assert_eq!(p.cursor(), 25);
            // nothing above 25 exists, so the next tick keeps it
            p.tick().await.unwrap();
            assert_eq!(p.cursor(), 25);
            assert_eq!(stored_start_id(&h.path), 25);
        }

        #[tokio::test]
        async fn unreachable_feed_aborts_without_persisting() {
            let feed = ScriptedFeed {
                hits: [21].into_iter().collect(),
                unreachable: true,
                ..Default::default()
            };
            let (mut p, h) = poller(Arc::new(feed));
            let err = p.tick().await.unwrap_err();
            assert_eq!(err.rule, "feed");
            assert_eq!(p.cursor(), 20);
            assert_eq!(stored_start_id(&h.path), 20);
        }

        #[tokio::test]
        async fn only_matching_titles_are_announced() {
            let feed = ScriptedTitles::new(&[(21, "New listing: ABC"), (22, "Maintenance window")]);
            let (mut p, h) = poller(Arc::new(feed));
            p.tick().await.unwrap();
            // the cursor covers filtered-out items too
            assert_eq!(p.cursor(), 22);

            drop(p);
            h.router.await.unwrap();
            assert_eq!(
                h.sink.take(),
                vec![Sent::Text(
                    Destination::ChatChannel { target_id: 1 },
                    "**[Source: Exchange]**\n\n**New listing: ABC**\nhttps://feed.example/a/21".into()
                )]
            );
        }
    }
}
