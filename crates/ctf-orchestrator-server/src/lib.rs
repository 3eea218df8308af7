//! Service-to-service lifecycle API and the guest-shell terminal hop.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ctf_common::{
    CtfError, InstanceSummary, StartInstanceRequest, StartedInstance, StopInstanceRequest,
    ORCH_TOKEN_HEADER,
};
use ctf_orchestrator::InstanceManager;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

pub mod terminal;

#[cfg(test)]
mod tests;

#[derive(Clone)]
pub struct AppState {
    pub manager: InstanceManager,
    token: Arc<str>,
}

impl AppState {
    pub fn new(manager: InstanceManager, token: impl Into<Arc<str>>) -> Self {
        Self {
            manager,
            token: token.into(),
        }
    }

    fn token_matches(&self, presented: &str) -> bool {
        presented.as_bytes().ct_eq(self.token.as_bytes()).into()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
    #[serde(skip)]
    status: u16,
}

impl From<CtfError> for ApiError {
    fn from(err: CtfError) -> Self {
        Self {
            status: err.http_status(),
            code: err.code().to_string(),
            error: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Rejects the request unless it carries the shared secret.
pub(crate) fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), ApiError> {
    let presented = headers
        .get(ORCH_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CtfError::Unauthorized("missing service token".to_string()))?;
    if !state.token_matches(presented) {
        warn!("Rejected request with invalid service token");
        return Err(CtfError::Unauthorized("invalid service token".to_string()).into());
    }
    Ok(())
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/instances/start", post(start_instance_handler))
        .route("/instances/stop", post(stop_instance_handler))
        .route("/instances", get(list_instances_handler))
        .route("/ws/terminal/:instance_id", get(terminal::terminal_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[instrument(skip_all, fields(owner_id = %request.owner_id, challenge_id = %request.challenge_id))]
async fn start_instance_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartInstanceRequest>,
) -> Result<Json<StartedInstance>, ApiError> {
    authorize(&headers, &state)?;
    let instance = state.manager.start(request).await?;
    Ok(Json(StartedInstance::from(&instance)))
}

async fn stop_instance_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StopInstanceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&headers, &state)?;
    request.validate()?;
    let stopped = state.manager.stop(&request.instance_id).await?;
    info!(instance_id = %request.instance_id, stopped, "Stop request handled");
    Ok(Json(json!({ "status": "stopped" })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(alias = "user_id")]
    pub owner_id: String,
}

async fn list_instances_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<InstanceSummary>>, ApiError> {
    authorize(&headers, &state)?;
    if query.owner_id.trim().is_empty() {
        return Err(CtfError::BadRequest("missing owner_id".to_string()).into());
    }
    Ok(Json(state.manager.list(&query.owner_id).await?))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = match state.manager.runtime().ping().await {
        Ok(()) => "ok",
        Err(e) => {
            warn!(error = %e, "Runtime ping failed");
            "unavailable"
        }
    };
    Json(json!({
        "status": "healthy",
        "runtime": runtime,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
