//! One query, end to end: session, page, submit, poll, extract, release.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::extractor::{self, AnswerOrigin};
use crate::navigator::{self, ModelChoice, NAVIGATION_TIMEOUT};
use crate::page::PageDriver;
use crate::poller::{self, PollProfile};
use crate::selectors::SelectorSet;
use crate::session::{Release, Session, SessionManager, SessionOptions};
use crate::submitter;

pub use crate::extractor::Source;

/// Which model the caller would like answering. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelHint {
    #[default]
    Default,
    #[serde(alias = "variantA")]
    VariantA,
    #[serde(alias = "variantB")]
    VariantB,
    #[serde(alias = "variantC")]
    VariantC,
    #[serde(alias = "variantD")]
    VariantD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Direct,
    DeepResearch,
}

impl QueryMode {
    pub fn poll_profile(self) -> PollProfile {
        match self {
            Self::Direct => PollProfile::DIRECT,
            Self::DeepResearch => PollProfile::DEEP_RESEARCH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub model_hint: ModelHint,
    pub time_budget: Duration,
    pub mode: QueryMode,
}

impl QueryRequest {
    pub fn new(
        text: &str,
        model_hint: ModelHint,
        time_budget: Duration,
        mode: QueryMode,
    ) -> Result<Self, AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::InvalidRequest("query must not be empty".into()));
        }
        if time_budget.is_zero() {
            return Err(AgentError::InvalidRequest(
                "time budget must be at least one second".into(),
            ));
        }
        Ok(Self {
            text: text.to_string(),
            model_hint,
            time_budget,
            mode,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub model_label: String,
    pub query: String,
    pub answer_text: String,
    pub sources: Vec<Source>,
    pub timestamp: DateTime<Utc>,
    pub converged: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename = "deep_research", rename_all = "camelCase")]
pub struct DeepResearchRecord {
    pub query: String,
    pub answer_text: String,
    pub timestamp: DateTime<Utc>,
    pub converged: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResearchOutput {
    Deep(DeepResearchRecord),
    Direct(ResultRecord),
}

impl ResearchOutput {
    pub fn answer_text(&self) -> &str {
        match self {
            Self::Direct(r) => &r.answer_text,
            Self::Deep(r) => &r.answer_text,
        }
    }

    pub fn converged(&self) -> bool {
        match self {
            Self::Direct(r) => r.converged,
            Self::Deep(r) => r.converged,
        }
    }
}

/// Request progress. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Navigating,
    Submitting,
    Polling,
    Converged,
    TimedOut,
    Extracting,
    Done,
}

impl Stage {
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Idle, Navigating)
                | (Navigating, Submitting)
                | (Submitting, Polling)
                | (Polling, Converged)
                | (Polling, TimedOut)
                | (Converged, Extracting)
                | (TimedOut, Extracting)
                | (Extracting, Done)
        )
    }

    pub fn advance(self, next: Stage) -> Result<Stage, AgentError> {
        if !self.can_advance_to(next) {
            return Err(AgentError::Browser(format!(
                "illegal stage transition {self:?} -> {next:?}"
            )));
        }
        debug!(from = ?self, to = ?next, "stage");
        Ok(next)
    }
}

#[derive(Debug, Clone)]
pub struct ResearchSettings {
    pub target_url: String,
    pub session: SessionOptions,
    /// Park persistent sessions after each request instead of closing them.
    pub keep_alive: bool,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            target_url: "https://www.perplexity.ai/".to_string(),
            session: SessionOptions::default(),
            keep_alive: true,
        }
    }
}

/// Runs queries against the chat page.
///
/// Requests on a persistent profile must not overlap: Chrome locks the profile
/// directory. Callers sharing a `Researcher` configured with a persistent
/// profile serialize their calls to [`Researcher::run`].
pub struct Researcher {
    sessions: Arc<SessionManager>,
    settings: ResearchSettings,
    selectors: Arc<SelectorSet>,
}

impl Researcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        settings: ResearchSettings,
        selectors: Arc<SelectorSet>,
    ) -> Self {
        Self {
            sessions,
            settings,
            selectors,
        }
    }

    /// Production wiring: Chrome backend with the configured selector tables.
    pub fn with_chrome(settings: &crate::config::Settings) -> Self {
        let sessions = Arc::new(SessionManager::new(Arc::new(crate::chrome::ChromeBackend)));
        Self::new(
            sessions,
            settings.research.clone(),
            Arc::new(settings.selectors.clone()),
        )
    }

    pub fn settings(&self) -> &ResearchSettings {
        &self.settings
    }

    /// Close any session parked for reuse.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    pub fn uses_persistent_profile(&self) -> bool {
        matches!(
            self.settings.session.profile,
            crate::session::Profile::Persistent(_)
        )
    }

    pub async fn run(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<ResearchOutput, AgentError> {
        let mut session = self.sessions.acquire(self.settings.session.clone()).await?;
        info!(
            session = %session.id(),
            warm = session.is_warm(),
            mode = ?request.mode,
            "🔍 starting query"
        );

        let outcome = self.drive(&mut session, request, cancel).await;

        let release = if self.settings.keep_alive && session.is_persistent() {
            Release::KeepAlive
        } else {
            Release::Close
        };
        self.sessions.release(session, release).await;

        match &outcome {
            Ok(output) => info!(converged = output.converged(), "🎯 query finished"),
            Err(e) => warn!(kind = e.kind(), "query failed: {e}"),
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut Session,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<ResearchOutput, AgentError> {
        let selectors = self.selectors.as_ref();
        let page = session.page().await?;
        let page: &dyn PageDriver = page.as_ref();
        let mut warnings = Vec::new();

        let mut stage = Stage::Idle.advance(Stage::Navigating)?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            navigated = navigator::navigate(
                page,
                &self.settings.target_url,
                session.ready_policy(),
                NAVIGATION_TIMEOUT,
            ) => navigated?,
        }

        let model = match request.mode {
            QueryMode::Direct => {
                navigator::select_model(page, selectors, request.model_hint, cancel).await?
            }
            QueryMode::DeepResearch => ModelChoice {
                label: selectors.default_label().to_string(),
                warning: None,
            },
        };
        warnings.extend(model.warning.clone());
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        stage = stage.advance(Stage::Submitting)?;
        submitter::submit(page, selectors, &request.text, cancel).await?;

        stage = stage.advance(Stage::Polling)?;
        let profile = request.mode.poll_profile();
        let polled = poller::poll(page, selectors, profile, request.time_budget, cancel).await;
        stage = stage.advance(if polled.converged {
            Stage::Converged
        } else {
            Stage::TimedOut
        })?;
        if !polled.converged {
            warnings.push(format!(
                "answer did not settle after {} polls ({:?}); text may be partial",
                polled.ticks, polled.reason
            ));
        }

        stage = stage.advance(Stage::Extracting)?;
        let visible = if polled.text.chars().count() > profile.min_chars {
            String::new()
        } else {
            page.visible_text().await.unwrap_or_else(|e| {
                warn!("reading page text failed: {e:#}");
                String::new()
            })
        };
        let (answer_text, origin) =
            extractor::finalize_answer(&polled.text, &visible, profile.min_chars);
        match origin {
            AnswerOrigin::Candidate => {}
            AnswerOrigin::PageText => warnings
                .push("answer selectors matched too little; reporting the whole page text".into()),
            AnswerOrigin::Placeholder => {
                warnings.push("no text could be extracted from the page".into())
            }
        }

        let timestamp = Utc::now();
        let output = match request.mode {
            QueryMode::Direct => {
                let sources = match extractor::origin_host(&self.settings.target_url) {
                    Some(host) => extractor::extract_sources(page, &host)
                        .await
                        .unwrap_or_else(|e| {
                            warnings.push(format!("sources unavailable: {e}"));
                            Vec::new()
                        }),
                    None => Vec::new(),
                };
                ResearchOutput::Direct(ResultRecord {
                    model_label: model.label,
                    query: request.text.clone(),
                    answer_text,
                    sources,
                    timestamp,
                    converged: polled.converged,
                    warnings,
                })
            }
            QueryMode::DeepResearch => ResearchOutput::Deep(DeepResearchRecord {
                query: request.text.clone(),
                answer_text,
                timestamp,
                converged: polled.converged,
                warnings,
            }),
        };

        stage.advance(Stage::Done)?;
        Ok(output)
    }
}
