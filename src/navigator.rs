//! Page loading and the optional model pick before a query is sent.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::page::{wait_for_any, PageDriver, ReadyPolicy, WaitTimedOut};
use crate::research::ModelHint;
use crate::selectors::SelectorSet;

/// Slow external pages are reported, not retried.
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to look for the model picker and its entries.
pub const MODEL_SWITCH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn navigate(
    page: &dyn PageDriver,
    url: &str,
    ready: ReadyPolicy,
    timeout: Duration,
) -> Result<(), AgentError> {
    info!(url, ?ready, "📡 loading page");
    match tokio::time::timeout(timeout, page.goto(url, ready, timeout)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.downcast_ref::<WaitTimedOut>().is_some() => {
            Err(AgentError::NavigationTimeout {
                url: url.to_string(),
                after: timeout,
            })
        }
        Ok(Err(e)) => Err(AgentError::Navigation {
            url: url.to_string(),
            reason: format!("{e:#}"),
        }),
        Err(_) => Err(AgentError::NavigationTimeout {
            url: url.to_string(),
            after: timeout,
        }),
    }
}

/// Model actually in use for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub label: String,
    /// Set when the requested model could not be selected and the page's
    /// default is used instead.
    pub warning: Option<String>,
}

impl ModelChoice {
    fn fallback(selectors: &SelectorSet, requested: &str, reason: &str) -> Self {
        let label = selectors.default_label().to_string();
        warn!(requested, reason, "model selection skipped, using {label}");
        Self {
            warning: Some(format!(
                "requested model {requested} was not selected ({reason}); answered by {label}"
            )),
            label,
        }
    }
}

/// Best effort: never fails the request. Anything that goes wrong degrades
/// to the default model with a warning.
pub async fn select_model(
    page: &dyn PageDriver,
    selectors: &SelectorSet,
    hint: ModelHint,
    cancel: &CancellationToken,
) -> Result<ModelChoice, AgentError> {
    if hint == ModelHint::Default {
        return Ok(ModelChoice {
            label: selectors.default_label().to_string(),
            warning: None,
        });
    }

    let Some(option) = selectors.model(hint) else {
        return Ok(ModelChoice::fallback(
            selectors,
            &format!("{hint:?}"),
            "no picker entry configured",
        ));
    };

    let switcher = wait_for_any(page, &selectors.model_switchers, MODEL_SWITCH_TIMEOUT, cancel).await?;
    let Some(switcher) = switcher else {
        return Ok(ModelChoice::fallback(
            selectors,
            &option.label,
            "model picker not found",
        ));
    };

    if let Err(e) = page.click(&switcher).await {
        return Ok(ModelChoice::fallback(
            selectors,
            &option.label,
            &format!("could not open model picker: {e}"),
        ));
    }

    if wait_for_any(page, &selectors.model_option_scopes, MODEL_SWITCH_TIMEOUT, cancel)
        .await?
        .is_some()
    {
        for scope in &selectors.model_option_scopes {
            match page.click_text(scope, &option.option_text).await {
                Ok(true) => {
                    info!(model = %option.label, "model selected");
                    return Ok(ModelChoice {
                        label: option.label.clone(),
                        warning: None,
                    });
                }
                Ok(false) => {}
                Err(e) => warn!(scope, "model option click failed: {e:#}"),
            }
        }
    }

    // leave the picker closed for the input lookup
    let _ = page.press_key("Escape").await;
    Ok(ModelChoice::fallback(
        selectors,
        &option.label,
        "model entry not found in picker",
    ))
}
