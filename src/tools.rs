//! The `ask` and `deep_research` tools and their response envelope.
//!
//! Every call ends in a [`ToolResponse`]. Failures become envelopes with
//! `isError: true`; nothing here panics or propagates to the transport.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::AgentError;
use crate::research::{ModelHint, QueryMode, QueryRequest, Researcher};

pub const ASK: &str = "ask";
pub const DEEP_RESEARCH: &str = "deep_research";

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[schema(value_type = Object)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text".into(),
                text: text.into(),
            }],
            is_error: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: Some(true),
            ..Self::text(text)
        }
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskArgs {
    query: String,
    #[serde(default, alias = "model_hint")]
    model_hint: ModelHint,
    #[serde(default, alias = "time_budget_seconds")]
    time_budget_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeepResearchArgs {
    query: String,
    #[serde(default, alias = "max_time_seconds", alias = "time_budget_seconds")]
    time_budget_seconds: Option<f64>,
}

fn budget(seconds: Option<f64>, default: Duration) -> Result<Duration, AgentError> {
    match seconds {
        None => Ok(default),
        Some(s) if s.is_finite() && s >= 1.0 => Duration::try_from_secs_f64(s)
            .map_err(|e| AgentError::InvalidRequest(format!("time budget {s} is out of range: {e}"))),
        Some(s) => Err(AgentError::InvalidRequest(format!(
            "time budget must be at least 1 second, got {s}"
        ))),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, AgentError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| AgentError::InvalidRequest(e.to_string()))
}

pub struct ToolBox {
    researcher: Arc<Researcher>,
    ask_budget: Duration,
    research_budget: Duration,
    /// Held for the whole request when the researcher drives a persistent profile.
    profile_gate: Mutex<()>,
}

impl ToolBox {
    pub fn new(researcher: Arc<Researcher>, ask_budget: Duration, research_budget: Duration) -> Self {
        Self {
            researcher,
            ask_budget,
            research_budget,
            profile_gate: Mutex::new(()),
        }
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: ASK.into(),
                description: "Ask the answer engine a question through a real browser and return \
                              the answer text with its cited sources."
                    .into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Question to ask" },
                        "modelHint": {
                            "type": "string",
                            "enum": ["default", "variant_a", "variant_b", "variant_c", "variant_d"],
                            "description": "Preferred model. Falls back to the default with a warning when unavailable."
                        },
                        "timeBudgetSeconds": {
                            "type": "number",
                            "description": "How long to wait for the answer",
                            "default": self.ask_budget.as_secs()
                        }
                    },
                    "required": ["query"]
                }),
            },
            ToolDescriptor {
                name: DEEP_RESEARCH.into(),
                description: "Run a long deep-research query through a real browser. May take \
                              several minutes."
                    .into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Topic to research" },
                        "timeBudgetSeconds": {
                            "type": "number",
                            "description": "Maximum wait in seconds (alias: max_time_seconds)",
                            "default": self.research_budget.as_secs()
                        }
                    },
                    "required": ["query"]
                }),
            },
        ]
    }

    pub async fn call(&self, name: &str, args: Value, cancel: &CancellationToken) -> ToolResponse {
        let request_id = Uuid::new_v4();
        let span = info_span!("tool", %request_id, tool = name);
        async move {
            match self.dispatch(name, args, cancel).await {
                Ok(text) => ToolResponse::text(text),
                Err(e) => {
                    warn!(kind = e.kind(), "tool call failed: {e}");
                    ToolResponse::error(format!("{name} failed ({}): {e}", e.kind()))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let request = match name {
            ASK => {
                let args: AskArgs = parse_args(args)?;
                QueryRequest::new(
                    &args.query,
                    args.model_hint,
                    budget(args.time_budget_seconds, self.ask_budget)?,
                    QueryMode::Direct,
                )?
            }
            DEEP_RESEARCH => {
                let args: DeepResearchArgs = parse_args(args)?;
                QueryRequest::new(
                    &args.query,
                    ModelHint::Default,
                    budget(args.time_budget_seconds, self.research_budget)?,
                    QueryMode::DeepResearch,
                )?
            }
            other => return Err(AgentError::InvalidRequest(format!("unknown tool: {other}"))),
        };
        info!(budget_secs = request.time_budget.as_secs(), "tool call accepted");

        let _gate = if self.researcher.uses_persistent_profile() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                guard = self.profile_gate.lock() => Some(guard),
            }
        } else {
            None
        };

        let output = self.researcher.run(&request, cancel).await?;
        serde_json::to_string_pretty(&output)
            .map_err(|e| AgentError::browser("serializing result", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::ResearchSettings;
    use crate::selectors::SelectorSet;
    use crate::session::SessionManager;
    use crate::testing::{answer_frame, CountingBackend, ScriptedPage};

    const HOME: &str = r#"<html><body><textarea></textarea></body></html>"#;

    fn toolbox(frames: Vec<String>) -> ToolBox {
        let page = Arc::new(ScriptedPage::new(HOME, frames));
        let sessions = Arc::new(SessionManager::new(Arc::new(CountingBackend::new(page))));
        let researcher = Researcher::new(
            sessions,
            ResearchSettings::default(),
            Arc::new(SelectorSet::default()),
        );
        ToolBox::new(
            Arc::new(researcher),
            Duration::from_secs(120),
            Duration::from_secs(600),
        )
    }

    fn body(response: &ToolResponse) -> Value {
        serde_json::from_str(&response.content[0].text).unwrap()
    }

    #[test]
    fn lists_both_tools_with_schemas() {
        let tools = toolbox(vec![]).list();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, [ASK, DEEP_RESEARCH]);
        assert_eq!(tools[0].input_schema["required"][0], "query");

        let json = serde_json::to_value(&tools[1]).unwrap();
        assert!(json.get("inputSchema").is_some());
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_envelope() {
        let response = toolbox(vec![])
            .call("summon", json!({}), &CancellationToken::new())
            .await;
        assert!(response.is_error());
        assert!(response.content[0].text.contains("unknown tool: summon"));
    }

    #[tokio::test]
    async fn missing_query_is_an_error_envelope() {
        let response = toolbox(vec![])
            .call(ASK, json!({ "modelHint": "variant_a" }), &CancellationToken::new())
            .await;
        assert!(response.is_error());
        assert!(response.content[0].text.contains("invalid_request"));
    }

    #[tokio::test]
    async fn rejects_non_positive_budget() {
        let response = toolbox(vec![])
            .call(ASK, json!({ "query": "q", "timeBudgetSeconds": 0 }), &CancellationToken::new())
            .await;
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn huge_budget_is_an_error_envelope() {
        let response = toolbox(vec![])
            .call(ASK, json!({ "query": "q", "timeBudgetSeconds": 1e20 }), &CancellationToken::new())
            .await;
        assert!(response.is_error());
        assert!(response.content[0].text.contains("invalid_request"));
    }

    #[test]
    fn budget_range() {
        let fallback = Duration::from_secs(120);
        assert_eq!(budget(None, fallback).unwrap(), fallback);
        assert_eq!(budget(Some(1.5), fallback).unwrap(), Duration::from_millis(1500));
        assert!(budget(Some(0.5), fallback).is_err());
        assert!(budget(Some(f64::NAN), fallback).is_err());
        assert!(budget(Some(1e20), fallback).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ask_returns_result_json() {
        let answer = "An answer long enough to count as settled. ".repeat(4);
        let tools = toolbox(vec![answer_frame(&answer, false)]);

        let response = tools
            .call(ASK, json!({ "query": "hello" }), &CancellationToken::new())
            .await;

        assert!(!response.is_error());
        assert_eq!(response.content[0].kind, "text");
        let json = body(&response);
        assert_eq!(json["query"], "hello");
        assert_eq!(json["modelLabel"], "Best");
        assert_eq!(json["converged"], true);
        assert!(json["sources"].is_array());

        let envelope = serde_json::to_value(&response).unwrap();
        assert!(envelope.get("isError").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deep_research_accepts_max_time_seconds() {
        let tools = toolbox(vec![answer_frame("still researching", true)]);

        let response = tools
            .call(
                DEEP_RESEARCH,
                json!({ "query": "topic", "max_time_seconds": 20 }),
                &CancellationToken::new(),
            )
            .await;

        let json = body(&response);
        assert_eq!(json["type"], "deep_research");
        assert_eq!(json["converged"], false);
        assert!(json["warnings"][0].as_str().unwrap().contains("after 2 polls"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_carry_the_error_kind() {
        let tools = toolbox(vec![]);
        let page_without_input = Arc::new(ScriptedPage::new("<html><body></body></html>", vec![]));
        let sessions = Arc::new(SessionManager::new(Arc::new(CountingBackend::new(page_without_input))));
        let tools = ToolBox {
            researcher: Arc::new(Researcher::new(
                sessions,
                ResearchSettings::default(),
                Arc::new(SelectorSet::default()),
            )),
            ..tools
        };

        let response = tools
            .call(ASK, json!({ "query": "q" }), &CancellationToken::new())
            .await;
        assert!(response.is_error());
        assert!(response.content[0].text.starts_with("ask failed (input_not_found)"));
    }
}
