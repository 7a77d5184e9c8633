// src/dispatch/links.rs
//! Markdown link flattening for relayed text.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static RE_MD_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]*)\]\(([^)\s]+)\)").expect("markdown link regex"));

/// Rewrite every `[label](url)` span to the bare URL without its query string.
/// The label is kept in front of the URL unless it is empty or equal to it.
/// Text without such spans is returned unchanged.
pub fn normalize_links(text: &str) -> String {
    RE_MD_LINK
        .replace_all(text, |caps: &Captures<'_>| {
            let label = caps[1].trim();
            let url = strip_query(&caps[2]);
            if label.is_empty() || label == url {
                url.to_string()
            } else {
                format!("{label} {url}")
            }
        })
        .into_owned()
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
