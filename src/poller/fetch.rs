// src/poller/fetch.rs
//! Feed-fetch collaborators for numbered feeds.

use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use regex::Regex;
use reqwest::StatusCode;

use crate::error::FetchError;

/// An item found at a numbered resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub id: u64,
    pub title: String,
    pub url: String,
}

/// `Ok(None)` means the id does not exist; an `Err` is a transport problem.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, id: u64) -> Result<Option<FeedItem>, FetchError>;
}

/// Normalize scraped text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Collapse whitespace
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 4) Length cap: 500 chars
    if out.chars().count() > 500 {
        out = out.chars().take(500).collect();
    }
    out
}

/// Contents of the first `<title>` element, normalized.
pub fn extract_title(html: &str) -> Option<String> {
    static RE_TITLE: OnceCell<Regex> = OnceCell::new();
    let re = RE_TITLE
        .get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));
    re.captures(html)
        .map(|c| normalize_text(&c[1]))
        .filter(|t| !t.is_empty())
}

/// Fetches `base_url_template` with `{id}` substituted.
#[derive(Clone)]
pub struct HttpFeedFetcher {
    template: String,
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("announce-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            template: template.into(),
            client,
        }
    }
}

pub(crate) fn classify(e: &reqwest::Error) -> FetchError {
    if e.is_connect() {
        FetchError::Unreachable(e.to_string())
    } else {
        FetchError::Transport(e.to_string())
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, id: u64) -> Result<Option<FeedItem>, FetchError> {
        let url = self.template.replace("{id}", &id.to_string());
        let t0 = std::time::Instant::now();
        let rsp = self.client.get(&url).send().await.map_err(|e| {
            counter!("poller_fetch_errors_total").increment(1);
            classify(&e)
        })?;

        let status = rsp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Transport(format!("{url}: HTTP {status}")));
        }
        let body = rsp
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("{url}: body: {e}")))?;
        histogram!("poller_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        let title = extract_title(&body).unwrap_or_else(|| url.clone());
        Ok(Some(FeedItem { id, title, url }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn normalize_collapses_ws_and_entities() {
        assert_eq!(
            normalize_text("  New&nbsp;listing:\n <b>ABC</b>  &amp; XYZ "),
            "New listing: ABC & XYZ"
        );
    }

    #[test]
    fn extract_title_is_case_insensitive_and_multiline() {
        let html = "<html><head><TITLE>\n  Gate lists ABC &amp; DEF\n</TITLE></head></html>";
        assert_eq!(extract_title(html).as_deref(), Some("Gate lists ABC & DEF"));
        assert_eq!(extract_title("<p>no title</p>"), None);
    }

    #[tokio::test]
    async fn http_fetcher_distinguishes_hit_miss_and_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a/21"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<title>Maintenance notice</title>", "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a/22"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a/23"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let fetcher = HttpFeedFetcher::new(
            format!("{}/a/{{id}}", server.uri()),
            Duration::from_secs(5),
        );

        let hit = fetcher.fetch(21).await.unwrap().unwrap();
        assert_eq!(hit.title, "Maintenance notice");
        assert_eq!(hit.url, format!("{}/a/21", server.uri()));

        assert!(fetcher.fetch(22).await.unwrap().is_none());
        assert!(matches!(
            fetcher.fetch(23).await,
            Err(FetchError::Transport(_))
        ));
    }
}
