use color_eyre::eyre;
use ctf_orchestrator::{InstanceManager, OrchestratorConfig, Reaper, SecurityPolicy};
use ctf_orchestrator_server::{create_app, AppState};
use ctf_runtime::{ContainerRuntime, DockerRuntime};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,ctf_orchestrator=debug,ctf_orchestrator_server=debug")
            }),
        )
        .init();

    let config = OrchestratorConfig::from_env()?;
    if config.token == "orch-dev-token" {
        warn!("ORCH_TOKEN not set, using the development token");
    }
    let policy = SecurityPolicy::from_config(&config).await?;

    let runtime = Arc::new(DockerRuntime::connect_local()?);
    match runtime.ping().await {
        Ok(()) => info!("Connected to Docker"),
        Err(e) => warn!(error = %e, "Docker is not reachable yet"),
    }

    let manager = InstanceManager::new(runtime, config.clone(), policy);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = tokio::spawn(Reaper::new(manager.clone()).run(shutdown_rx));

    let app = create_app(AppState::new(manager, config.token.clone()));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = reaper.await {
        error!(error = %e, "Reaper task ended abnormally");
    }
    info!("Orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
