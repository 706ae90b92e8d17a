//! Failure taxonomy for a single query request.
//!
//! Everything here is fatal for the request that raised it. Recoverable
//! conditions (empty extraction, budget exhausted before the answer settled)
//! are recorded on the result instead of being raised.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The browser process or its profile could not be started.
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation to {url} did not finish within {}s", .after.as_secs())]
    NavigationTimeout { url: String, after: Duration },

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    /// None of the input candidates appeared. Usually means the page layout
    /// changed and the selector table needs an update.
    #[error("no input field matched within {}s (tried: {})", .waited.as_secs(), .tried.join(", "))]
    InputNotFound { waited: Duration, tried: Vec<String> },

    #[error("browser error: {0}")]
    Browser(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled")]
    Cancelled,
}

impl AgentError {
    /// Stable identifier used in error envelopes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch(_) => "launch_error",
            Self::NavigationTimeout { .. } => "navigation_timeout",
            Self::Navigation { .. } => "navigation_error",
            Self::InputNotFound { .. } => "input_not_found",
            Self::Browser(_) => "browser_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Cancelled => "cancelled",
        }
    }

    pub(crate) fn browser(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Browser(format!("{context}: {err}"))
    }
}
