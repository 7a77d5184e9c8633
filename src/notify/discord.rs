use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use super::{split_message, ChatSink};
use crate::error::SinkError;
use crate::rules::Destination;

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;

/// Discord bot sink for `chat-channel` destinations.
#[derive(Clone)]
pub struct DiscordSink {
    token: String,
    api_base: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordSink {
    pub fn new(token: String) -> Self {
        Self {
            token,
            api_base: DISCORD_API_BASE.to_string(),
            client: Client::new(),
            timeout: Duration::from_secs(20),
            max_retries: 3,
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    fn messages_url(&self, destination: Destination) -> String {
        format!(
            "{}/channels/{}/messages",
            self.api_base,
            destination.target_id()
        )
    }

    /// POST with retry on transport errors and 5xx. 4xx responses are final.
    async fn post<F>(&self, destination: Destination, build: F) -> Result<(), SinkError>
    where
        F: Fn() -> Result<reqwest::RequestBuilder, SinkError>,
    {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = build()?
                .header("Authorization", format!("Bot {}", self.token))
                .timeout(self.timeout)
                .send()
                .await;

            let retry = match res {
                Ok(rsp) => {
                    let status = rsp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if status == StatusCode::PAYLOAD_TOO_LARGE {
                        return Err(SinkError::PayloadTooLarge);
                    }
                    let body = rsp.text().await.unwrap_or_default();
                    let err = transport(format!("{destination}: HTTP {status}: {body}"));
                    if !status.is_server_error() || attempt >= self.max_retries {
                        return Err(err);
                    }
                    err
                }
                Err(e) => {
                    let err = transport(format!("{destination}: {e}"));
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    err
                }
            };
            tracing::debug!(attempt, error = %retry, "discord send retry");
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}

fn transport(reason: String) -> SinkError {
    SinkError::Transport {
        sink: "discord".into(),
        reason,
    }
}

#[derive(Serialize)]
struct DiscordMessagePayload<'a> {
    content: &'a str,
}

#[async_trait]
impl ChatSink for DiscordSink {
    async fn send_text(&self, destination: Destination, text: &str) -> Result<(), SinkError> {
        let url = self.messages_url(destination);
        for chunk in split_message(text, DISCORD_MAX_MESSAGE_LENGTH) {
            self.post(destination, || {
                Ok(self
                    .client
                    .post(&url)
                    .json(&DiscordMessagePayload { content: &chunk }))
            })
            .await?;
        }
        Ok(())
    }

    async fn send_file(&self, destination: Destination, file: &Path) -> Result<(), SinkError> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| transport(format!("reading {}: {e}", file.display())))?;
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let url = self.messages_url(destination);

        self.post(destination, || {
            let part = Part::bytes(bytes.clone()).file_name(file_name.clone());
            Ok(self
                .client
                .post(&url)
                .multipart(Form::new().part("files[0]", part)))
        })
        .await?;
        tracing::info!(%destination, file = %file_name, "discord file sent");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "discord"
    }
}
