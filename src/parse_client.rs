//! Client for the remote batch parsing API.
//!
//! The service reads product SKUs from a spreadsheet column, parses each one
//! and writes results back into the sheet. This side only starts jobs and
//! follows their progress.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_SHEET_NAME: &str = "Парсинг товаров";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParseJob {
    pub spreadsheet_id: String,
    pub sheet_name: String,
    /// Column holding the SKUs.
    pub column_sku: String,
    /// First data row (1-based, below the header).
    pub start_row: u32,
}

impl ParseJob {
    pub fn new(spreadsheet_id: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            sheet_name: DEFAULT_SHEET_NAME.to_string(),
            column_sku: "A".to_string(),
            start_row: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParseStarted {
    pub task_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub task_id: String,
    /// pending, running, completed or failed
    pub status: String,
    pub progress: String,
    pub total: u64,
    pub processed: u64,
    pub errors: u64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceHealth {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

pub struct ParserClient {
    base_url: String,
    client: reqwest::Client,
}

impl ParserClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url).with_context(|| format!("invalid parser API url: {base_url}"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self { base_url, client })
    }

    async fn read<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("parser API returned {status}: {body}");
        }
        response.json::<T>().await.context("decoding parser API response")
    }

    pub async fn start(&self, job: &ParseJob) -> Result<ParseStarted> {
        let response = self
            .client
            .post(format!("{}/api/parse", self.base_url))
            .json(job)
            .send()
            .await
            .context("starting parse job")?;
        let started: ParseStarted = Self::read(response).await?;
        info!(task_id = %started.task_id, sheet = %job.sheet_name, "🚀 parse job started");
        Ok(started)
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        let response = self
            .client
            .get(format!("{}/api/parse/status/{}", self.base_url, task_id))
            .send()
            .await
            .context("fetching task status")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            bail!("task {task_id} not found");
        }
        Self::read(response).await
    }

    /// Parse a single SKU synchronously. The result shape belongs to the service.
    pub async fn parse_one(&self, sku: &str) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/api/parse/test", self.base_url))
            .query(&[("sku", sku)])
            .send()
            .await
            .context("parsing single SKU")?;
        Self::read(response).await
    }

    pub async fn health(&self) -> Result<ServiceHealth> {
        let response = self
            .client
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await
            .context("checking parser API health")?;
        Self::read(response).await
    }

    /// Poll `status` every `interval` until the task finishes or `max_wait`
    /// has passed. Returns the last status seen either way.
    pub async fn wait(&self, task_id: &str, interval: Duration, max_wait: Duration) -> Result<TaskStatus> {
        let deadline = Instant::now() + max_wait;
        loop {
            let status = self.status(task_id).await?;
            debug!(task_id, status = %status.status, progress = %status.progress, "task status");
            if status.is_terminal() || Instant::now() + interval > deadline {
                return Ok(status);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::routing::{get, post};
    use axum::{http::StatusCode, Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    async fn fake_service() -> String {
        let polls = Arc::new(AtomicU64::new(0));
        let app = Router::new()
            .route(
                "/api/parse",
                post(|Json(job): Json<ParseJob>| async move {
                    Json(ParseStarted {
                        task_id: "ab12cd34".into(),
                        status: "started".into(),
                        message: format!("sheet {} from row {}", job.sheet_name, job.start_row),
                    })
                }),
            )
            .route(
                "/api/parse/status/:task_id",
                get(move |Path(task_id): Path<String>| {
                    let polls = polls.clone();
                    async move {
                        if task_id != "ab12cd34" {
                            return Err(StatusCode::NOT_FOUND);
                        }
                        let n = polls.fetch_add(1, Ordering::SeqCst) + 1;
                        let done = n >= 3;
                        Ok(Json(TaskStatus {
                            task_id,
                            status: (if done { "completed" } else { "running" }).into(),
                            progress: format!("{n}/3"),
                            total: 3,
                            processed: n.min(3),
                            errors: 0,
                            started_at: Some("2024-05-01T10:00:00".into()),
                            completed_at: done.then(|| "2024-05-01T10:00:09".to_string()),
                        }))
                    }
                }),
            )
            .route(
                "/api/parse/test",
                post(|Query(q): Query<HashMap<String, String>>| async move {
                    Json(serde_json::json!({ "sku": q.get("sku"), "price": 1990 }))
                }),
            )
            .route(
                "/api/health",
                get(|| async { Json(serde_json::json!({ "status": "ok", "service": "parser" })) }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[test]
    fn job_defaults() {
        let job = ParseJob::new("sheet-id");
        assert_eq!(job.column_sku, "A");
        assert_eq!(job.start_row, 2);
        assert_eq!(job.sheet_name, DEFAULT_SHEET_NAME);
    }

    #[tokio::test]
    async fn start_then_wait_until_completed() {
        let client = ParserClient::new(&fake_service().await).unwrap();

        let started = client.start(&ParseJob::new("sheet-id")).await.unwrap();
        assert_eq!(started.task_id, "ab12cd34");
        assert!(started.message.contains("from row 2"));

        let status = client
            .wait(&started.task_id, Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(status.is_terminal());
        assert_eq!(status.status, "completed");
        assert_eq!(status.processed, 3);
    }

    #[tokio::test]
    async fn unknown_task_is_an_error() {
        let client = ParserClient::new(&fake_service().await).unwrap();
        let err = client.status("missing").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn single_sku_and_health() {
        let client = ParserClient::new(&fake_service().await).unwrap();
        let result = client.parse_one("123456").await.unwrap();
        assert_eq!(result["sku"], "123456");
        assert_eq!(client.health().await.unwrap().status, "ok");
    }

    #[tokio::test]
    async fn wait_gives_up_after_max_wait() {
        let client = ParserClient::new(&fake_service().await).unwrap();
        let status = client
            .wait("ab12cd34", Duration::from_secs(60), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status.status, "running");
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(ParserClient::new("not a url").is_err());
    }
}
