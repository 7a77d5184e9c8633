// src/dispatch/mod.rs
//! Delivery of one logical message to one destination.

pub mod links;
pub mod queue;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, SinkError};
use crate::notify::ChatSink;
use crate::rules::Destination;

pub use links::normalize_links;
pub use queue::{spawn_dispatch_router, DispatchJob, DispatchQueue};

/// A file downloaded for relaying. Deleted from disk when the last handle drops,
/// whichever way delivery ended.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "staged file released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release staged file"),
        }
    }
}

/// Text and/or attachment relayed as one logical message.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub text: Option<String>,
    pub attachment: Option<Arc<StagedFile>>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, file: StagedFile) -> Self {
        self.attachment = Some(Arc::new(file));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty()) && self.attachment.is_none()
    }
}

pub fn provenance_header(label: &str) -> String {
    format!("**[Source: {label}]**\n\n")
}

pub fn oversize_notice(label: &str) -> String {
    format!("**[Forward failed]**\nThe file from **{label}** is too large to upload.")
}

/// Body for an item discovered by a feed poller.
pub fn announcement_text(title: &str, time: Option<&str>, link: &str) -> String {
    let mut out = format!("**{title}**\n");
    if let Some(t) = time.filter(|t| !t.trim().is_empty()) {
        out.push_str(t.trim());
        out.push('\n');
    }
    out.push_str(link);
    out
}

/// Sends payloads through a [`ChatSink`] with a bounded time per send.
pub struct Dispatcher {
    sink: Arc<dyn ChatSink>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn ChatSink>, send_timeout: Duration) -> Self {
        Self { sink, send_timeout }
    }

    /// Deliver `payload` to `destination`, prefixed with the provenance header.
    ///
    /// Text and attachment are attempted independently. A size refusal of the
    /// attachment is answered with a notice to the same destination and is not
    /// an error. The staged attachment handle is dropped on return.
    pub async fn deliver(
        &self,
        payload: Payload,
        destination: Destination,
        label: &str,
    ) -> Result<(), DispatchError> {
        let header = provenance_header(label);
        let text = payload
            .text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(normalize_links);

        let mut first_error: Option<DispatchError> = None;

        match &text {
            Some(body) => {
                let full = format!("{header}{body}");
                if let Err(e) = self.send_text(destination, &full).await {
                    warn!(%destination, label, error = %e, "text delivery failed");
                    first_error.get_or_insert(e.into());
                }
            }
            None if payload.attachment.is_some() => {
                // context for an attachment-only message
                if let Err(e) = self.send_text(destination, header.trim_end()).await {
                    warn!(%destination, label, error = %e, "header delivery failed");
                    first_error.get_or_insert(e.into());
                }
            }
            None => {}
        }

        if let Some(file) = payload.attachment {
            match self.send_file(destination, file.path()).await {
                Ok(()) => {}
                Err(SinkError::PayloadTooLarge) => {
                    let size_mb = file.size_bytes().unwrap_or(0) as f64 / (1024.0 * 1024.0);
                    warn!(%destination, label, size_mb, "attachment too large, sending notice");
                    counter!("relay_oversize_notices_total").increment(1);
                    if let Err(e) = self.send_text(destination, &oversize_notice(label)).await {
                        warn!(%destination, label, error = %e, "oversize notice failed");
                    }
                }
                Err(e) => {
                    warn!(%destination, label, error = %e, "attachment delivery failed");
                    first_error.get_or_insert(DispatchError::TransportFailure(e.to_string()));
                }
            }
        }

        match first_error {
            None => {
                counter!("relay_dispatch_total").increment(1);
                info!(%destination, label, "delivered");
                Ok(())
            }
            Some(e) => {
                counter!("relay_dispatch_errors_total").increment(1);
                Err(e)
            }
        }
    }

    async fn send_text(&self, destination: Destination, text: &str) -> Result<(), SinkError> {
        tokio::time::timeout(self.send_timeout, self.sink.send_text(destination, text))
            .await
            .unwrap_or(Err(SinkError::Timeout(self.send_timeout)))
    }

    async fn send_file(&self, destination: Destination, file: &Path) -> Result<(), SinkError> {
        tokio::time::timeout(self.send_timeout, self.sink.send_file(destination, file))
            .await
            .unwrap_or(Err(SinkError::Timeout(self.send_timeout)))
    }
}
