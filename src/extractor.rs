//! Final answer text and citation harvesting.

use std::collections::HashSet;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dom::{Anchor, Snapshot};
use crate::error::AgentError;
use crate::page::PageDriver;

pub const MAX_SOURCES: usize = 10;
pub const MAX_TITLE_CHARS: usize = 100;

/// Substituted when neither the answer selectors nor the page text yield anything.
pub const NO_ANSWER_PLACEHOLDER: &str = "[no answer text could be extracted from the page]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
}

/// Where the reported answer text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOrigin {
    Candidate,
    PageText,
    Placeholder,
}

/// Pick the text to report. A short or empty poll result is replaced by the
/// page's whole visible text; the result is never empty.
pub fn finalize_answer(best: &str, visible_text: &str, min_chars: usize) -> (String, AnswerOrigin) {
    let best = best.trim();
    let visible = visible_text.trim();

    if best.chars().count() > min_chars {
        return (best.to_string(), AnswerOrigin::Candidate);
    }
    if !visible.is_empty() {
        warn!(
            best_chars = best.chars().count(),
            "answer selectors came up short, falling back to page text"
        );
        return (visible.to_string(), AnswerOrigin::PageText);
    }
    if !best.is_empty() {
        return (best.to_string(), AnswerOrigin::Candidate);
    }
    warn!("nothing could be extracted from the page");
    (NO_ANSWER_PLACEHOLDER.to_string(), AnswerOrigin::Placeholder)
}

fn bare_host(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// True when `host` is `origin` or one of its subdomains.
fn same_site(host: &str, origin: &str) -> bool {
    let host = bare_host(host);
    let origin = bare_host(origin);
    host.eq_ignore_ascii_case(origin)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", origin.to_ascii_lowercase()))
}

fn clean_title(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_TITLE_CHARS).collect()
}

/// Citations among `anchors`: absolute http(s) links off the origin site,
/// deduplicated by url, in document order, at most [`MAX_SOURCES`].
pub fn filter_sources(anchors: &[Anchor], origin_host: &str) -> Vec<Source> {
    let mut seen = HashSet::new();
    let mut sources = Vec::new();

    for anchor in anchors {
        let Ok(url) = Url::parse(&anchor.href) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        let Some(host) = url.host_str() else {
            continue;
        };
        if same_site(host, origin_host) {
            continue;
        }

        let title = clean_title(&anchor.text);
        let href = anchor.href.trim().to_string();
        if title.is_empty() || href.is_empty() || !seen.insert(href.clone()) {
            continue;
        }

        sources.push(Source { title, url: href });
        if sources.len() == MAX_SOURCES {
            break;
        }
    }

    debug!(anchors = anchors.len(), kept = sources.len(), "sources filtered");
    sources
}

/// Read the page's anchors and keep the citations. Does not touch the page.
pub async fn extract_sources(
    page: &dyn PageDriver,
    origin_host: &str,
) -> Result<Vec<Source>, AgentError> {
    let html = page
        .html()
        .await
        .map_err(|e| AgentError::browser("reading page for sources", format!("{e:#}")))?;
    let anchors = Snapshot::parse(&html).anchors();
    Ok(filter_sources(&anchors, origin_host))
}

/// Host part of `url`, used as the origin when filtering sources.
pub fn origin_host(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}
