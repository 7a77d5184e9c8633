//! Error types for the relay.
//!
//! Only [`ConfigError`] is allowed to stop the process. Everything else is
//! local to one rule, one probe, or one destination.

use std::time::Duration;

/// Malformed routing table or environment. Fatal at start-up.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("rule {rule}: missing required field {field}")]
    MissingField { rule: String, field: String },

    #[error("rule {rule}: invalid regex {pattern:?}: {reason}")]
    InvalidRegex {
        rule: String,
        pattern: String,
        reason: String,
    },

    #[error("rule {rule}: {message}")]
    InvalidRule { rule: String, message: String },

    #[error("duplicate rule name: {0}")]
    DuplicateRule(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("rule {0} not found in config file")]
    UnknownRule(String),

    #[error("failed to write config: {0}")]
    Write(#[from] std::io::Error),
}

/// Failure fetching a single feed resource. A plain "not found" is not an
/// error; fetchers return `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The feed host itself could not be reached. Aborts the whole tick.
    #[error("feed unreachable: {0}")]
    Unreachable(String),
}

/// Errors reported by a chat sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Destination refused the payload for size (HTTP 413 or equivalent).
    #[error("payload too large")]
    PayloadTooLarge,

    #[error("send failed on {sink}: {reason}")]
    Transport { sink: String, reason: String },

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("no sink configured for {0}")]
    Unconfigured(String),
}

/// Outcome of delivering one payload to one destination.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Kept for callers that deliver without the oversize fallback.
    #[error("payload too large for destination")]
    PayloadTooLarge,

    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl From<SinkError> for DispatchError {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::PayloadTooLarge => DispatchError::PayloadTooLarge,
            other => DispatchError::TransportFailure(other.to_string()),
        }
    }
}

/// A whole poller tick failed; no cursor change is persisted.
#[derive(Debug, thiserror::Error)]
#[error("tick aborted for rule {rule}: {reason}")]
pub struct TickAbort {
    pub rule: String,
    pub reason: String,
}

/// Seen-set persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum SeenStoreError {
    #[error("seen-set io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
