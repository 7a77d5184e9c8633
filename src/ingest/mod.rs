// src/ingest/mod.rs
//! Inbound chat messages: the collaborator pushes [`InboundEvent`]s, this
//! module matches them against the routing table and queues the fan-out.

pub mod telegram;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dispatch::{DispatchQueue, Payload, StagedFile};
use crate::rules::{merge_destinations, ChatId, RuleEngine};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("relay_inbound_total", "Inbound chat messages received.");
        describe_counter!(
            "relay_inbound_routed_total",
            "Inbound chat messages that matched at least one rule."
        );
    });
}

/// A message pushed by a chat-source collaborator.
#[derive(Debug)]
pub struct InboundEvent {
    pub source: ChatId,
    pub text: Option<String>,
    pub attachment: Option<StagedFile>,
    /// Chat title or display name, used as the provenance label.
    pub title: String,
}

impl InboundEvent {
    pub fn text(source: ChatId, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source,
            text: Some(text.into()),
            attachment: None,
            title: title.into(),
        }
    }

    fn label(&self) -> String {
        if self.title.trim().is_empty() {
            format!("ID: {}", self.source)
        } else {
            self.title.clone()
        }
    }
}

/// Route one inbound event. Returns the number of deliveries queued.
///
/// Attachment-only messages are matched against empty text. An event no rule
/// wants is dropped, releasing any staged attachment.
pub async fn handle_inbound(engine: &RuleEngine, queue: &DispatchQueue, event: InboundEvent) -> usize {
    ensure_metrics_described();
    counter!("relay_inbound_total").increment(1);

    let label = event.label();
    let text = event.text.as_deref().unwrap_or_default();
    let routes = engine.route_chat(event.source, text);
    let destinations = merge_destinations(&routes);
    if destinations.is_empty() {
        debug!(source = event.source, %label, "no rule matched inbound message");
        return 0;
    }
    counter!("relay_inbound_routed_total").increment(1);
    info!(
        source = event.source,
        %label,
        rules = ?routes.iter().map(|r| r.rule.as_str()).collect::<Vec<_>>(),
        destinations = destinations.len(),
        "inbound message routed"
    );

    let mut payload = Payload {
        text: event.text,
        attachment: None,
    };
    if let Some(file) = event.attachment {
        payload = payload.with_attachment(file);
    }
    queue.submit(&destinations, payload, &label).await
}

/// Consume events from a chat-source collaborator until its channel closes.
pub fn spawn_inbound_router(
    engine: RuleEngine,
    queue: DispatchQueue,
    mut rx: mpsc::Receiver<InboundEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle_inbound(&engine, &queue, event).await;
        }
        info!("inbound router stopped");
    })
}
