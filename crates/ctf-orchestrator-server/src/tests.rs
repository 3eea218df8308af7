use crate::{create_app, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use ctf_common::{InstanceSummary, StartedInstance};
use ctf_orchestrator::{InstanceManager, OrchestratorConfig, SecurityPolicy};
use ctf_runtime::MockRuntime;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::HeaderValue,
    protocol::frame::coding::CloseCode,
    Message,
};
use tower::ServiceExt;

const TOKEN: &str = "test-token";

fn setup() -> (Arc<MockRuntime>, AppState) {
    let runtime = Arc::new(MockRuntime::new());
    let manager = InstanceManager::new(
        runtime.clone(),
        OrchestratorConfig::default(),
        SecurityPolicy::login_shell(),
    );
    (runtime, AppState::new(manager, TOKEN))
}

fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-orch-token", TOKEN)
        .header("content-type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn start(app: &Router, owner: &str, challenge: &str) -> StartedInstance {
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/instances/start",
            Some(json!({
                "image": "ctf/pwn01:latest",
                "owner_id": owner,
                "challenge_id": challenge,
                "public_key": "ssh-ed25519 AAAA"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_, state) = setup();
    let response = create_app(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["runtime"], "ok");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_requests_without_secret_are_rejected_before_runtime_calls() {
    let (runtime, state) = setup();
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/instances/start")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"image": "img", "owner_id": "1", "challenge_id": "c"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: serde_json::Value = body_json(response).await;
    assert_eq!(error["code"], "UNAUTHORIZED");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/instances?owner_id=1")
                .header("x-orch-token", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_start_list_stop_cycle() {
    let (runtime, state) = setup();
    let app = create_app(state);

    let started = start(&app, "1", "pwn01").await;
    assert_eq!(started.host, "127.0.0.1");
    assert!(started.port.is_some());
    start(&app, "2", "pwn01").await;

    let response = app
        .clone()
        .oneshot(authed("GET", "/instances?owner_id=1", None))
        .await
        .unwrap();
    let listed: Vec<InstanceSummary> = body_json(response).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].instance_id, started.instance_id);

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/instances/stop",
            Some(json!({ "instance_id": started.instance_id })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let ack: serde_json::Value = body_json(response).await;
    assert_eq!(ack["status"], "stopped");
    assert_eq!(runtime.containers().len(), 1);
}

#[tokio::test]
async fn test_start_validation_and_idempotent_stop() {
    let (runtime, state) = setup();
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/instances/start",
            Some(json!({"image": "", "owner_id": "1", "challenge_id": "c"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(authed(
            "POST",
            "/instances/stop",
            Some(json!({ "instance_id": "never-existed" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(runtime.mutations().is_empty());
}

#[tokio::test]
async fn test_provisioning_failure_maps_to_bad_gateway() {
    let (runtime, state) = setup();
    runtime.fail_container_creation(true);
    let app = create_app(state);

    let response = app
        .oneshot(authed(
            "POST",
            "/instances/start",
            Some(json!({"image": "img", "owner_id": "1", "challenge_id": "c"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let error: serde_json::Value = body_json(response).await;
    assert_eq!(error["code"], "PROVISIONING_FAILED");
}

async fn serve(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_app(state)).await.unwrap();
    });
    addr
}

fn terminal_request(
    addr: SocketAddr,
    instance_id: &str,
    token: &'static str,
) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = format!("ws://{addr}/ws/terminal/{instance_id}")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-orch-token", HeaderValue::from_static(token));
    request
}

#[tokio::test]
async fn test_terminal_relays_bytes_in_order_and_tears_down_on_close() {
    let (runtime, state) = setup();
    let instance = state
        .manager
        .start(ctf_common::StartInstanceRequest {
            image: "img".to_string(),
            owner_id: "1".to_string(),
            challenge_id: "c".to_string(),
            public_key: None,
        })
        .await
        .unwrap();
    let addr = serve(state).await;

    let (mut client, _) = tokio_tungstenite::connect_async(terminal_request(addr, &instance.id, TOKEN))
        .await
        .unwrap();
    let mut shell = runtime.next_shell().await.unwrap();

    client.send(Message::Text("ls ".to_string())).await.unwrap();
    client.send(Message::Binary(b"-la\n".to_vec())).await.unwrap();
    client.send(Message::Text("id\n".to_string())).await.unwrap();
    let mut received = vec![0u8; 10];
    shell.stdin.read_exact(&mut received).await.unwrap();
    assert_eq!(received, b"ls -la\nid\n");

    shell.stdout.write_all(b"total 0\n").await.unwrap();
    shell.stdout.write_all(b"uid=1000(ctf)\n").await.unwrap();
    let mut output = Vec::new();
    while output.len() < 22 {
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => output.extend(data),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(output, b"total 0\nuid=1000(ctf)\n");

    // Closing the browser side ends the shell side even though it never closed.
    client.close(None).await.unwrap();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), shell.stdin.read_to_end(&mut rest))
        .await
        .expect("shell input was not closed");
    assert!(read.is_ok());
}

#[tokio::test]
async fn test_terminal_rejects_bad_secret() {
    let (runtime, state) = setup();
    let addr = serve(state).await;

    let result = tokio_tungstenite::connect_async(terminal_request(addr, "any", "wrong")).await;
    assert!(result.is_err());
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_terminal_unknown_instance_closes_with_policy_code() {
    let (_, state) = setup();
    let addr = serve(state).await;

    let (mut client, _) = tokio_tungstenite::connect_async(terminal_request(addr, "missing", TOKEN))
        .await
        .unwrap();
    match client.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn test_terminal_reports_status_of_stopped_instance() {
    let (runtime, state) = setup();
    let instance = state
        .manager
        .start(ctf_common::StartInstanceRequest {
            image: "img".to_string(),
            owner_id: "1".to_string(),
            challenge_id: "c".to_string(),
            public_key: None,
        })
        .await
        .unwrap();
    runtime.set_state(&instance.container_id, "exited");
    let addr = serve(state).await;

    let (mut client, _) = tokio_tungstenite::connect_async(terminal_request(addr, &instance.id, TOKEN))
        .await
        .unwrap();
    match client.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text, "Error: Container is exited\r\n"),
        other => panic!("unexpected frame: {other:?}"),
    }
    assert!(runtime.calls().iter().all(|c| !c.starts_with("exec:")));
}
