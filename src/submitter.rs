//! Typing the query into the chat input and sending it.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::page::{wait_for_any, PageDriver};
use crate::selectors::SelectorSet;

/// Bound on the input lookup. A page without any known input has changed
/// layout, so there is no retry after this.
pub const INPUT_WAIT: Duration = Duration::from_secs(10);

/// Type `text` into the first input candidate that shows up and send it with
/// Enter.
pub async fn submit(
    page: &dyn PageDriver,
    selectors: &SelectorSet,
    text: &str,
    cancel: &CancellationToken,
) -> Result<(), AgentError> {
    let Some(input) = wait_for_any(page, &selectors.input_candidates, INPUT_WAIT, cancel).await?
    else {
        warn!(
            tried = ?selectors.input_candidates,
            "no input field found, selector table may be out of date"
        );
        return Err(AgentError::InputNotFound {
            waited: INPUT_WAIT,
            tried: selectors.input_candidates.clone(),
        });
    };

    page.fill(&input, text)
        .await
        .map_err(|e| AgentError::browser("filling query input", format!("{e:#}")))?;
    page.press_key("Enter")
        .await
        .map_err(|e| AgentError::browser("submitting query", format!("{e:#}")))?;

    info!(input = %input, chars = text.chars().count(), "✉️ query submitted");
    Ok(())
}
