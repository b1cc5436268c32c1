//! HTTP surface.
//!
//! A thin, non-streaming JSON API over the scheduler: chat, generate, and
//! embed resolve the model, take a lease, and proxy the call to the runner
//! process under a parallelism permit. `ps` and `unload` expose the
//! scheduler's management operations.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{KilnError, Result};
use crate::model::store::ModelStore;
use crate::model::{Capability, RunnerOptions};
use crate::runner::KeepAlive;
use crate::sched::{Lease, Scheduler};

pub struct AppState {
    pub scheduler: Scheduler,
    pub store: ModelStore,
    pub client: reqwest::Client,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/generate", post(generate))
        .route("/api/embed", post(embed))
        .route("/api/ps", get(ps))
        .route("/api/unload", post(unload))
        .with_state(state)
}

/// `KilnError` rendered as a JSON error body with the mapped status code.
struct ApiError(KilnError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        tracing::debug!("Request failed: {} ({})", self.0, status);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<KilnError> for ApiError {
    fn from(e: KilnError) -> Self {
        Self(e)
    }
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    options: Option<RunnerOptions>,
    /// Seconds; negative = keep forever, 0 = unload after the call.
    #[serde(default)]
    keep_alive: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    options: Option<RunnerOptions>,
    #[serde(default)]
    keep_alive: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EmbedRequest {
    model: String,
    input: Value,
    #[serde(default)]
    options: Option<RunnerOptions>,
    #[serde(default)]
    keep_alive: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UnloadRequest {
    model: String,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    let lease = acquire(
        &state,
        &req.model,
        req.options.clone(),
        req.keep_alive,
        Capability::Completion,
    )
    .await?;
    let body = json!({
        "messages": req.messages.iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect::<Vec<_>>(),
    });
    let out = proxy(&state, &lease, "completion", body).await?;
    Ok(Json(out))
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    let lease = acquire(
        &state,
        &req.model,
        req.options.clone(),
        req.keep_alive,
        Capability::Completion,
    )
    .await?;
    let body = json!({ "prompt": req.prompt });
    let out = proxy(&state, &lease, "completion", body).await?;
    Ok(Json(out))
}

async fn embed(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmbedRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    let lease = acquire(
        &state,
        &req.model,
        req.options.clone(),
        req.keep_alive,
        Capability::Embedding,
    )
    .await?;
    let body = json!({ "input": req.input });
    let out = proxy(&state, &lease, "embedding", body).await?;
    Ok(Json(out))
}

async fn ps(State(state): State<Arc<AppState>>) -> Json<Value> {
    let runners = state.scheduler.ps().await;
    Json(json!({ "runners": runners }))
}

async fn unload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UnloadRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    let resolved = state.store.resolve(&req.model)?;
    state.scheduler.expire_runner(&resolved.key);
    Ok(Json(json!({ "status": "unloading" })))
}

/// Resolve the model and take a lease for one call.
async fn acquire(
    state: &AppState,
    model: &str,
    options: Option<RunnerOptions>,
    keep_alive: Option<i64>,
    required: Capability,
) -> Result<Lease> {
    let resolved = state.store.resolve(model)?;
    state
        .scheduler
        .get_runner(
            resolved,
            options.unwrap_or_default(),
            &[required],
            keep_alive.map(KeepAlive::from_secs),
        )
        .await
}

/// Forward a JSON body to the leased runner under a parallelism permit.
async fn proxy(state: &AppState, lease: &Lease, endpoint: &str, body: Value) -> Result<Value> {
    let url = format!("http://127.0.0.1:{}/{}", lease.port(), endpoint);
    lease
        .with_permit(async {
            if lease.is_dead() {
                return Err(KilnError::RunnerDied);
            }
            let resp = state.client.post(&url).json(&body).send().await?;
            let value = resp.json::<Value>().await?;
            Ok(value)
        })
        .await
}
