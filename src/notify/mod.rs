// src/notify/mod.rs
//! Outbound chat sinks: the platform clients a relayed message ends up in.

pub mod discord;
pub mod telegram;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::rules::Destination;

/// Send side of a chat platform.
///
/// Implementations must report a size refusal as [`SinkError::PayloadTooLarge`]
/// so the dispatcher can replace the payload with a notice.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send_text(&self, destination: Destination, text: &str) -> Result<(), SinkError>;
    async fn send_file(&self, destination: Destination, file: &Path) -> Result<(), SinkError>;
    fn name(&self) -> &'static str;
}

/// Routes `chat-channel` destinations to Discord and `chat-group` destinations to Telegram.
#[derive(Clone, Default)]
pub struct SinkMux {
    channels: Option<Arc<dyn ChatSink>>,
    groups: Option<Arc<dyn ChatSink>>,
}

impl SinkMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(mut self, sink: Arc<dyn ChatSink>) -> Self {
        self.channels = Some(sink);
        self
    }

    pub fn with_groups(mut self, sink: Arc<dyn ChatSink>) -> Self {
        self.groups = Some(sink);
        self
    }

    fn pick(&self, destination: Destination) -> Result<&Arc<dyn ChatSink>, SinkError> {
        let slot = match destination {
            Destination::ChatChannel { .. } => &self.channels,
            Destination::ChatGroup { .. } => &self.groups,
        };
        slot.as_ref()
            .ok_or_else(|| SinkError::Unconfigured(destination.to_string()))
    }
}

#[async_trait]
impl ChatSink for SinkMux {
    async fn send_text(&self, destination: Destination, text: &str) -> Result<(), SinkError> {
        self.pick(destination)?.send_text(destination, text).await
    }

    async fn send_file(&self, destination: Destination, file: &Path) -> Result<(), SinkError> {
        self.pick(destination)?.send_file(destination, file).await
    }

    fn name(&self) -> &'static str {
        "mux"
    }
}

/// Split a message into chunks that fit a platform's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
pub(crate) fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_chars {
            chunks.push(remaining.to_string());
            break;
        }

        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map_or(remaining.len(), |(i, _)| i);
        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("hi", 10), vec!["hi".to_string()]);
    }

    #[test]
    fn splits_on_newline_first() {
        let chunks = split_message("aaaa\nbbbb cccc", 10);
        assert_eq!(chunks, vec!["aaaa".to_string(), "bbbb cccc".to_string()]);
    }

    #[test]
    fn hard_cut_respects_char_boundaries() {
        let chunks = split_message("ééééé", 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[tokio::test]
    async fn mux_without_sink_reports_unconfigured() {
        let mux = SinkMux::new();
        let err = mux
            .send_text(Destination::ChatGroup { target_id: 1 }, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Unconfigured(_)));
    }
}
