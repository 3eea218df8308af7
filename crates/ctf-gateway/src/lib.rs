//! Browser-facing gateway: user authentication, challenge lookup, the
//! lifecycle proxy and the first terminal hop.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ctf_common::{
    ChallengeCatalog, CtfError, Identity, InstanceProvisioner, InstanceSummary,
    StartInstanceRequest, StartedInstance, StopInstanceRequest, TokenVerifier,
};
use ctf_relay::{bridge, Endpoint};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, instrument, warn};

pub mod auth;
pub mod catalog;
pub mod client;
pub mod config;
pub mod tickets;


pub use auth::JwtVerifier;
pub use catalog::JsonChallengeCatalog;
pub use client::{OrchestratorClient, TerminalUpstream};
pub use config::GatewayConfig;
pub use tickets::{IssuedTicket, TicketStore};

#[derive(Clone)]
pub struct GatewayState {
    pub provisioner: Arc<dyn InstanceProvisioner>,
    pub terminal: Arc<dyn TerminalUpstream>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub catalog: Arc<dyn ChallengeCatalog>,
    pub tickets: Arc<TicketStore>,
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

async fn authenticate(headers: &HeaderMap, state: &GatewayState) -> Result<Identity, ApiError> {
    let token = auth::bearer_token(headers)?;
    Ok(state.verifier.verify(token).await?)
}

/// Not-found unless `identity` owns `instance_id`.
async fn ensure_owned(
    state: &GatewayState,
    identity: &Identity,
    instance_id: &str,
) -> Result<(), ApiError> {
    let owned = state.provisioner.list(&identity.subject).await?;
    if owned.iter().any(|i| i.instance_id == instance_id) {
        Ok(())
    } else {
        Err(CtfError::NotFound(format!("instance {instance_id}")).into())
    }
}

pub fn create_app(state: GatewayState) -> Router {
    Router::new()
        .route("/api/instances/start", post(start_instance_handler))
        .route("/api/instances/stop", post(stop_instance_handler))
        .route("/api/instances", get(list_instances_handler))
        .route("/api/terminal/tickets", post(issue_ticket_handler))
        .route("/ws/terminal/:instance_id", get(terminal_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub challenge_id: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[instrument(skip_all, fields(challenge_id = %request.challenge_id))]
async fn start_instance_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartedInstance>, ApiError> {
    let identity = authenticate(&headers, &state).await?;
    let challenge = state
        .catalog
        .lookup(&request.challenge_id)
        .await?
        .ok_or_else(|| CtfError::NotFound(format!("challenge {}", request.challenge_id)))?;

    let started = state
        .provisioner
        .start(StartInstanceRequest {
            image: challenge.image,
            owner_id: identity.subject.clone(),
            challenge_id: challenge.id,
            public_key: request.public_key,
        })
        .await?;
    info!(owner_id = %identity, instance_id = %started.instance_id, "Instance started for user");
    Ok(Json(started))
}

async fn stop_instance_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<StopInstanceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = authenticate(&headers, &state).await?;
    request.validate()?;
    ensure_owned(&state, &identity, &request.instance_id).await?;
    state.provisioner.stop(&request.instance_id).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn list_instances_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<Vec<InstanceSummary>>, ApiError> {
    let identity = authenticate(&headers, &state).await?;
    Ok(Json(state.provisioner.list(&identity.subject).await?))
}

#[derive(Debug, Deserialize)]
pub struct TicketRequest {
    pub instance_id: String,
}

async fn issue_ticket_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<TicketRequest>,
) -> Result<Json<IssuedTicket>, ApiError> {
    let identity = authenticate(&headers, &state).await?;
    ensure_owned(&state, &identity, &request.instance_id).await?;
    Ok(Json(state.tickets.issue(&identity, &request.instance_id)))
}

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    pub ticket: Option<String>,
}

async fn terminal_handler(
    ws: WebSocketUpgrade,
    Path(instance_id): Path<String>,
    Query(query): Query<TerminalQuery>,
    State(state): State<GatewayState>,
) -> Result<Response, ApiError> {
    let ticket = query
        .ticket
        .ok_or_else(|| CtfError::Unauthorized("missing ticket".to_string()))?;
    let identity = state.tickets.redeem(&ticket, &instance_id)?;
    let upstream = state.terminal.clone();
    Ok(ws.on_upgrade(move |socket| relay_terminal(socket, upstream, identity, instance_id)))
}

async fn relay_terminal(
    mut socket: WebSocket,
    upstream: Arc<dyn TerminalUpstream>,
    identity: Identity,
    instance_id: String,
) {
    let next_hop = match upstream.connect(&instance_id).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(%instance_id, error = %e, "Terminal upstream unavailable");
            if let Err(e) = socket
                .send(Message::Text("Error: terminal unavailable\r\n".to_string()))
                .await
            {
                debug!(%instance_id, error = %e, "Failed to send terminal error");
                return;
            }
            if let Err(e) = socket.send(Message::Close(None)).await {
                debug!(%instance_id, error = %e, "Failed to close terminal socket");
            }
            return;
        }
    };

    info!(user = %identity, %instance_id, "Relaying terminal");
    let outcome = bridge(Endpoint::from_axum(socket), next_hop).await;
    info!(
        user = %identity,
        %instance_id,
        ended_by = ?outcome.ended_by,
        "Terminal relay closed"
    );
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
