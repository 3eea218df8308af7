//! Shared helpers for the Docker-backed test suites.

use ctf_common::StartInstanceRequest;
use ctf_orchestrator::{InstanceManager, OrchestratorConfig, SecurityPolicy};
use ctf_runtime::{ContainerRuntime, DockerRuntime, ExecSpec};
use futures::StreamExt;
use std::sync::{Arc, Once};

/// Long-running image that needs no extra setup.
pub const TEST_IMAGE: &str = "nginx:alpine";

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        dotenvy::dotenv().ok();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,ctf_orchestrator=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub async fn docker_manager(config: OrchestratorConfig) -> (Arc<DockerRuntime>, InstanceManager) {
    init_tracing();
    let runtime = Arc::new(DockerRuntime::connect_local().expect("docker client"));
    runtime.ping().await.expect("docker ping");
    let policy = SecurityPolicy::login_shell();
    let manager = InstanceManager::new(runtime.clone(), config, policy);
    (runtime, manager)
}

/// Request with an owner id unique to this run so parallel suites never collide.
pub fn unique_request(challenge_id: &str) -> StartInstanceRequest {
    StartInstanceRequest {
        image: TEST_IMAGE.to_string(),
        owner_id: format!("tester-{}", uuid::Uuid::new_v4().simple()),
        challenge_id: challenge_id.to_string(),
        public_key: None,
    }
}

/// Runs `script` with `sh -c` inside the container and returns everything it printed.
pub async fn run_script(runtime: &DockerRuntime, container_id: &str, script: &str) -> String {
    let spec = ExecSpec {
        cmd: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        ..Default::default()
    };
    let mut session = runtime.exec(container_id, &spec).await.expect("exec");
    let mut output = Vec::new();
    while let Some(chunk) = session.output.next().await {
        output.extend(chunk.expect("exec output"));
    }
    String::from_utf8_lossy(&output).into_owned()
}

pub async fn remove_volume(runtime: &DockerRuntime, name: &str) {
    if let Err(e) = runtime.client().remove_volume(name, None).await {
        tracing::warn!(volume = %name, error = %e, "Failed to clean up test volume");
    }
}
