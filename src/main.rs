//! announce-relay binary entrypoint.
//! Loads the routing table, wires sinks, pollers and the chat listener, and
//! runs until Ctrl-C.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use announce_relay::api::{self, AppState};
use announce_relay::config::{load_routing_table, ConfigStore, Settings};
use announce_relay::dispatch::{spawn_dispatch_router, Dispatcher};
use announce_relay::ingest::{spawn_inbound_router, telegram::spawn_telegram_listener};
use announce_relay::metrics::Metrics;
use announce_relay::notify::{discord::DiscordSink, telegram::TelegramBot, SinkMux};
use announce_relay::poller::{
    CursorBoard, HttpFeedFetcher, HttpLinkListFetcher, LinkListPoller, WatermarkPoller,
};
use announce_relay::rules::RuleEngine;
use announce_relay::seen::SeenSet;

const INBOUND_QUEUE_DEPTH: usize = 256;

/// Human-readable logs by default; JSON lines when RELAY_LOG_JSON=1.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("announce_relay=info,warn"));
    let json = std::env::var("RELAY_LOG_JSON").is_ok_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::from_env().context("invalid environment")?;
    let table = Arc::new(
        load_routing_table(&settings.config_path, &settings).context("invalid routing table")?,
    );
    let engine = RuleEngine::new(Arc::clone(&table));
    let store = Arc::new(ConfigStore::new(settings.config_path.clone()));
    let cursors = CursorBoard::from_table(&table);

    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed");
            None
        }
    };

    // --- Sinks ---
    let telegram = settings
        .telegram_bot_token
        .clone()
        .map(|t| TelegramBot::new(t).with_timeout(settings.send_timeout.as_secs()));
    let mut mux = SinkMux::new();
    match &settings.discord_bot_token {
        Some(token) => {
            mux = mux.with_channels(Arc::new(
                DiscordSink::new(token.clone()).with_timeout(settings.send_timeout.as_secs()),
            ))
        }
        None => warn!("DISCORD_BOT_TOKEN not set, chat-channel destinations will fail"),
    }
    match &telegram {
        Some(bot) => mux = mux.with_groups(Arc::new(bot.clone())),
        None => warn!("TELEGRAM_BOT_TOKEN not set, chat-group destinations will fail"),
    }
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(mux), settings.send_timeout));
    let (queue, dispatch_task) = spawn_dispatch_router(dispatcher);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // --- Numbered feeds ---
    for (rule, source) in table.id_sequence_rules() {
        let Some(cell) = cursors.cell(&rule.name) else {
            continue;
        };
        let fetcher = Arc::new(HttpFeedFetcher::new(
            source.base_url_template.clone(),
            settings.fetch_timeout,
        ));
        let poller = WatermarkPoller::new(
            rule,
            source.clone(),
            fetcher,
            engine.clone(),
            queue.clone(),
            Arc::clone(&store),
            cell,
            settings.poll_window,
            settings.fetch_timeout,
        )
        .with_active_hours(settings.active_hours);
        tasks.push(poller.spawn(shutdown_rx.clone()));
    }

    // --- Link-list feeds ---
    let mut seen_count = None;
    if table.link_list_rules().next().is_some() {
        let seen = SeenSet::load(&settings.seen_links_path).context("loading seen links")?;
        seen_count = Some(seen.count_handle());
        let seen = Arc::new(Mutex::new(seen));
        for (rule, source) in table.link_list_rules() {
            let fetcher = match HttpLinkListFetcher::new(source, settings.fetch_timeout) {
                Ok(f) => Arc::new(f),
                Err(e) => {
                    error!(rule = %rule.name, error = %e, "link-list feed disabled");
                    continue;
                }
            };
            let poller = LinkListPoller::new(
                rule,
                source,
                fetcher,
                engine.clone(),
                queue.clone(),
                Arc::clone(&seen),
                settings.fetch_timeout,
            )
            .with_active_hours(settings.active_hours);
            tasks.push(poller.spawn(shutdown_rx.clone()));
        }
    }

    // --- Chat listener ---
    let watched = table.chat_identities();
    if !watched.is_empty() {
        match telegram {
            Some(bot) => {
                let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
                tasks.push(spawn_telegram_listener(
                    bot,
                    watched,
                    settings.telegram_staging_dir.clone(),
                    tx,
                    shutdown_rx.clone(),
                ));
                tasks.push(spawn_inbound_router(engine.clone(), queue.clone(), rx));
            }
            None => warn!("chat-feed rules present but TELEGRAM_BOT_TOKEN not set"),
        }
    }
    // pollers and the inbound router hold the remaining handles
    drop(queue);

    // --- Diagnostics ---
    if let Some(addr) = settings.diag_addr.clone() {
        let app = api::router(
            AppState {
                cursors: cursors.clone(),
                seen_count,
            },
            metrics.as_ref(),
        );
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding diagnostics on {addr}"))?;
        info!(%addr, "diagnostics listening");
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "diagnostics server failed");
            }
        });
    }

    info!(rules = table.rules.len(), tasks = tasks.len(), "relay running");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for t in tasks {
            let _ = t.await;
        }
        let _ = dispatch_task.await;
    };
    if tokio::time::timeout(settings.shutdown_grace, drain).await.is_err() {
        warn!(grace = ?settings.shutdown_grace, "shutdown grace elapsed, exiting with work pending");
    }
    info!(cursors = ?cursors.snapshot(), "relay stopped");
    Ok(())
}
