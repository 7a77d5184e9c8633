//! Telegram listener: long-polls the Bot API and forwards posts from watched
//! chats as [`InboundEvent`]s.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::StagedFile;
use crate::ingest::InboundEvent;
use crate::notify::telegram::TelegramBot;
use crate::rules::ChatId;

const LONG_POLL_SECS: u64 = 30;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Post extracted from a Bot API update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPost {
    pub update_id: i64,
    pub chat_id: ChatId,
    pub title: String,
    pub text: Option<String>,
    /// `(file_id, file_name)` of a document or the largest photo size.
    pub file: Option<(String, String)>,
}

/// Extract the interesting parts of one update. Updates without a chat are skipped.
pub fn parse_update(update: &Value) -> Option<ParsedPost> {
    let update_id = update.get("update_id")?.as_i64()?;
    let message = update
        .get("channel_post")
        .or_else(|| update.get("message"))?;
    let chat = message.get("chat")?;
    let chat_id = chat.get("id")?.as_i64()?;

    let title = chat
        .get("title")
        .or_else(|| chat.get("username"))
        .or_else(|| chat.get("first_name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("ID: {chat_id}"));

    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let file = if let Some(doc) = message.get("document") {
        doc.get("file_id").and_then(Value::as_str).map(|id| {
            let name = doc
                .get("file_name")
                .and_then(Value::as_str)
                .unwrap_or("document");
            (id.to_string(), name.to_string())
        })
    } else {
        // photo sizes are listed smallest first
        message
            .get("photo")
            .and_then(Value::as_array)
            .and_then(|sizes| sizes.last())
            .and_then(|p| p.get("file_id"))
            .and_then(Value::as_str)
            .map(|id| (id.to_string(), "photo.jpg".to_string()))
    };

    Some(ParsedPost {
        update_id,
        chat_id,
        title,
        text,
        file,
    })
}

/// Spawn the long-poll loop. Stops when `shutdown` flips to true or the
/// receiving side of `tx` is gone.
pub fn spawn_telegram_listener(
    bot: TelegramBot,
    watched: BTreeSet<ChatId>,
    staging_dir: PathBuf,
    tx: mpsc::Sender<InboundEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut offset: i64 = 0;
        info!(chats = watched.len(), "Telegram listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let updates = tokio::select! {
                res = bot.get_updates(offset, LONG_POLL_SECS) => res,
                _ = shutdown.changed() => break,
            };
            let updates = match updates {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, "Telegram poll error");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            for update in &updates {
                let Some(post) = parse_update(update) else {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = offset.max(uid + 1);
                    }
                    continue;
                };
                offset = offset.max(post.update_id + 1);

                if !watched.contains(&post.chat_id) {
                    debug!(chat_id = post.chat_id, "ignoring unwatched chat");
                    continue;
                }
                info!(chat_id = post.chat_id, title = %post.title, "new Telegram message");

                let attachment = match &post.file {
                    Some((file_id, name)) => match bot.download(file_id, name, &staging_dir).await {
                        Ok(path) => Some(StagedFile::new(path)),
                        Err(e) => {
                            warn!(chat_id = post.chat_id, error = %e, "attachment download failed");
                            None
                        }
                    },
                    None => None,
                };
                if post.text.is_none() && attachment.is_none() {
                    continue;
                }

                let event = InboundEvent {
                    source: post.chat_id,
                    text: post.text,
                    attachment,
                    title: post.title,
                };
                if tx.send(event).await.is_err() {
                    info!("Telegram listener channel closed");
                    return;
                }
            }
        }
        info!("Telegram listener stopped");
    })
}
