//! Guest-shell hop: relays a websocket to a login shell inside the instance.

use crate::{authorize, ApiError, AppState};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::Response,
};
use ctf_common::CtfError;
use ctf_orchestrator::InstanceManager;
use ctf_relay::{bridge, Endpoint, StreamSource, WriterSink};
use std::borrow::Cow;
use tracing::{debug, info, warn};

pub async fn terminal_handler(
    ws: WebSocketUpgrade,
    Path(instance_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&headers, &state)?;
    let manager = state.manager.clone();
    Ok(ws.on_upgrade(move |socket| serve_terminal(socket, manager, instance_id)))
}

async fn serve_terminal(socket: WebSocket, manager: InstanceManager, instance_id: String) {
    let session = match manager.attach_shell(&instance_id).await {
        Ok(session) => session,
        Err(CtfError::NotFound(_)) => {
            warn!(%instance_id, "Terminal requested for unknown instance");
            close_with(socket, close_code::POLICY, "unknown instance").await;
            return;
        }
        Err(CtfError::NotRunning { status, .. }) => {
            report_and_close(socket, format!("Error: Container is {status}\r\n")).await;
            return;
        }
        Err(e) => {
            warn!(%instance_id, error = %e, "Could not open shell");
            report_and_close(socket, format!("Error: {e}\r\n")).await;
            return;
        }
    };

    info!(%instance_id, "Terminal session opened");
    let shell = Endpoint::new(
        StreamSource::new(session.output),
        WriterSink::new(session.input),
    );
    let outcome = bridge(Endpoint::from_axum(socket), shell).await;
    info!(
        %instance_id,
        ended_by = ?outcome.ended_by,
        bytes_in = outcome.forwarded,
        bytes_out = outcome.returned,
        "Terminal session closed"
    );
}

async fn report_and_close(mut socket: WebSocket, message: String) {
    if let Err(e) = socket.send(Message::Text(message)).await {
        debug!(error = %e, "Failed to send terminal status");
        return;
    }
    close_with(socket, close_code::NORMAL, "").await;
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to close terminal socket");
    }
}
