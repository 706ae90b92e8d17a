//! HTTP transport for the tools.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::tools::{ToolBox, ToolContent, ToolDescriptor, ToolResponse};

pub struct AppState {
    pub tools: Arc<ToolBox>,
    /// Cancelled on server shutdown; every call runs under a child token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub tools: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ToolCallRequest {
    /// `ask` or `deep_research`
    pub name: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub arguments: Value,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        tools: state.tools.list().len(),
    })
}

#[utoipa::path(
    get,
    path = "/tools",
    tag = "tools",
    responses((status = 200, description = "Available tools", body = [ToolDescriptor]))
)]
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Vec<ToolDescriptor>> {
    Json(state.tools.list())
}

/// Tool failures are reported inside the envelope with `isError`, so this
/// answers 200 for every well-formed request.
#[utoipa::path(
    post,
    path = "/tools/call",
    tag = "tools",
    request_body = ToolCallRequest,
    responses(
        (status = 200, description = "Tool result or error envelope", body = ToolResponse),
        (status = 400, description = "Malformed JSON body"),
        (status = 422, description = "Body does not match ToolCallRequest")
    )
)]
pub async fn call_tool(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ToolCallRequest>,
) -> Json<ToolResponse> {
    let cancel = state.shutdown.child_token();
    // client disconnects drop this future; the guard cancels the token with it
    let _guard = cancel.clone().drop_guard();
    Json(state.tools.call(&payload.name, payload.arguments, &cancel).await)
}

#[derive(OpenApi)]
#[openapi(
    paths(health, list_tools, call_tool),
    components(schemas(HealthResponse, ToolCallRequest, ToolDescriptor, ToolResponse, ToolContent)),
    tags(
        (name = "system", description = "Service status"),
        (name = "tools", description = "Browser-driven research tools")
    )
)]
pub struct ApiDoc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/tools/call", post(call_tool))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
