//! Telegram Bot API client. Serves `chat-group` destinations and backs the
//! inbound listener in [`crate::ingest::telegram`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{split_message, ChatSink};
use crate::error::SinkError;
use crate::rules::Destination;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

#[derive(Clone)]
pub struct TelegramBot {
    token: String,
    api_base: String,
    client: Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

impl TelegramBot {
    pub fn new(token: String) -> Self {
        Self {
            token,
            api_base: TELEGRAM_API_BASE.to_string(),
            client: Client::new(),
            timeout: Duration::from_secs(20),
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

    pub(crate) fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{file_path}", self.api_base, self.token)
    }

    async fn check(&self, rsp: reqwest::Response, what: &str) -> Result<(), SinkError> {
        let status = rsp.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(SinkError::PayloadTooLarge);
        }
        let body = rsp.text().await.unwrap_or_default();
        Err(transport(format!("{what}: HTTP {status}: {body}")))
    }

    /// Long-poll `getUpdates`. `wait_secs` is the server-side hold time.
    pub async fn get_updates(
        &self,
        offset: i64,
        wait_secs: u64,
    ) -> Result<Vec<serde_json::Value>, SinkError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": wait_secs,
            "allowed_updates": ["message", "channel_post"],
        });
        let rsp: ApiResponse<Vec<serde_json::Value>> = self
            .client
            .post(self.api_url("getUpdates"))
            .timeout(Duration::from_secs(wait_secs) + self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(format!("getUpdates: {e}")))?
            .json()
            .await
            .map_err(|e| transport(format!("getUpdates body: {e}")))?;
        if !rsp.ok {
            return Err(transport(format!(
                "getUpdates: {}",
                rsp.description.unwrap_or_default()
            )));
        }
        Ok(rsp.result.unwrap_or_default())
    }

    /// Download a file by `file_id` into `dir`, returning the local path.
    pub async fn download(
        &self,
        file_id: &str,
        file_name: &str,
        dir: &Path,
    ) -> Result<PathBuf, SinkError> {
        let info: ApiResponse<FileInfo> = self
            .client
            .post(self.api_url("getFile"))
            .timeout(self.timeout)
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|e| transport(format!("getFile: {e}")))?
            .json()
            .await
            .map_err(|e| transport(format!("getFile body: {e}")))?;
        let remote = info
            .result
            .and_then(|f| f.file_path)
            .ok_or_else(|| transport(format!("getFile: no file_path for {file_id}")))?;

        let rsp = self
            .client
            .get(self.file_url(&remote))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport(format!("file download: {e}")))?;
        if !rsp.status().is_success() {
            return Err(transport(format!("file download: HTTP {}", rsp.status())));
        }
        let bytes = rsp
            .bytes()
            .await
            .map_err(|e| transport(format!("file download body: {e}")))?;

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| transport(format!("staging dir {}: {e}", dir.display())))?;
        let local = dir.join(format!("{}-{}", sanitize(file_id), sanitize(file_name)));
        tokio::fs::write(&local, &bytes)
            .await
            .map_err(|e| transport(format!("writing {}: {e}", local.display())))?;
        Ok(local)
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

fn transport(reason: String) -> SinkError {
    SinkError::Transport {
        sink: "telegram".into(),
        reason,
    }
}

#[async_trait]
impl ChatSink for TelegramBot {
    async fn send_text(&self, destination: Destination, text: &str) -> Result<(), SinkError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let body = serde_json::json!({
                "chat_id": destination.target_id(),
                "text": chunk,
            });
            let rsp = self
                .client
                .post(self.api_url("sendMessage"))
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| transport(format!("sendMessage: {e}")))?;
            self.check(rsp, "sendMessage").await?;
        }
        Ok(())
    }

    async fn send_file(&self, destination: Destination, file: &Path) -> Result<(), SinkError> {
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| transport(format!("reading {}: {e}", file.display())))?;

        let form = Form::new()
            .text("chat_id", destination.target_id().to_string())
            .part("document", Part::bytes(bytes).file_name(file_name.clone()));

        let rsp = self
            .client
            .post(self.api_url("sendDocument"))
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport(format!("sendDocument: {e}")))?;
        self.check(rsp, "sendDocument").await?;
        tracing::info!(%destination, file = %file_name, "telegram document sent");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}
