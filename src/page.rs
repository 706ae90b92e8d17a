//! The browser capabilities the query pipeline consumes.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dom::Snapshot;
use crate::error::AgentError;

/// When a navigation counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyPolicy {
    /// Load event plus a quiet network window. Slow; used on cold sessions.
    NetworkIdle,
    /// The document body exists.
    DomContentLoaded,
}

/// One open tab. Selector matching happens on [`PageDriver::html`] snapshots,
/// so implementations only move bytes and dispatch input.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str, ready: ReadyPolicy, timeout: Duration) -> Result<()>;

    /// Serialized DOM of the current document.
    async fn html(&self) -> Result<String>;

    /// Rendered text of the whole body, as a user would see it.
    async fn visible_text(&self) -> Result<String>;

    /// Focus the first element matching `selector` and type `text` into it.
    async fn fill(&self, selector: &str, text: &str) -> Result<()>;

    async fn press_key(&self, key: &str) -> Result<()>;

    async fn click(&self, selector: &str) -> Result<()>;

    /// Click the first element matching `selector` whose text contains
    /// `needle`. Returns false when nothing matched.
    async fn click_text(&self, selector: &str, needle: &str) -> Result<bool>;
}

/// A driver's own bounded wait ran out. Drivers attach this to the error so
/// callers can tell a slow page from a broken one.
#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for the page")]
pub struct WaitTimedOut;

/// Gap between snapshots while waiting for an element.
pub const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn first_present(html: &str, patterns: &[String]) -> Option<String> {
    Snapshot::parse(html)
        .first_match(patterns)
        .map(str::to_string)
}

/// Poll the page until one of `patterns` matches, checking them in rank
/// order on every snapshot. Returns the matching pattern, or `None` once
/// `timeout` has elapsed.
pub async fn wait_for_any(
    page: &dyn PageDriver,
    patterns: &[String],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<String>, AgentError> {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            snapshot = tokio::time::timeout_at(deadline, page.html()) => snapshot,
        };
        let Ok(snapshot) = snapshot else {
            debug!("snapshot still pending at the deadline");
            return Ok(None);
        };
        match snapshot {
            Ok(html) => {
                if let Some(found) = first_present(&html, patterns) {
                    return Ok(Some(found));
                }
            }
            Err(e) => debug!("snapshot failed while waiting for element: {e:#}"),
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let nap = ELEMENT_POLL_INTERVAL.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            _ = tokio::time::sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPage;

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_highest_ranked_match() {
        let page = ScriptedPage::new(
            r#"<html><body><input type="text"><textarea></textarea></body></html>"#,
            vec![],
        );
        let found = wait_for_any(
            &page,
            &patterns(&["textarea", "input[type=\"text\"]"]),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(found.as_deref(), Some("textarea"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_at_the_deadline() {
        let page = ScriptedPage::new("<html><body></body></html>", vec![]);
        let started = Instant::now();
        let found = wait_for_any(
            &page,
            &patterns(&["textarea"]),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(found.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_snapshot_does_not_extend_the_wait() {
        let page = ScriptedPage::new("<html><body><textarea></textarea></body></html>", vec![])
            .with_html_delay(Duration::from_secs(20));
        let started = Instant::now();
        let found = wait_for_any(
            &page,
            &patterns(&["textarea"]),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(found.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_stops_on_cancel() {
        let page = ScriptedPage::new("<html><body></body></html>", vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_for_any(&page, &patterns(&["textarea"]), Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
