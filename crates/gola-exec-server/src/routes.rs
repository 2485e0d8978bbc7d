use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use gola_exec::{ExecutionResult, ExecutionService};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Tool-invocation envelope accepted by `POST /v1/execute`.
#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Clone)]
struct AppState {
    service: Arc<ExecutionService>,
}

pub fn build_router(service: Arc<ExecutionService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/v1/execute", post(execute_handler))
        .route("/v1/health", get(health_handler))
        .route("/v1/languages", get(languages_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn execute_handler(
    State(state): State<AppState>,
    Json(body): Json<ExecuteBody>,
) -> Json<ExecutionResult> {
    let mut request = state
        .service
        .request(body.language, body.code, body.timeout, body.stdin);
    if let Some(request_id) = body.request_id {
        request = request.with_request_id(request_id);
    }
    Json(state.service.execute(request).await)
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let providers = state.service.supervisor().health_snapshot();
    Json(json!({
        "status": "ok",
        "providers": providers,
        "timestamp": chrono::Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn languages_handler(State(state): State<AppState>) -> Json<Value> {
    let languages: Vec<String> = state.service.supervisor().languages().into_iter().collect();
    Json(json!({ "languages": languages }))
}
