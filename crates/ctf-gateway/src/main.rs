use color_eyre::eyre;
use ctf_gateway::{
    create_app, GatewayConfig, GatewayState, JsonChallengeCatalog, JwtVerifier,
    OrchestratorClient, TicketStore,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ctf_gateway=debug")),
        )
        .init();

    let config = GatewayConfig::from_env()?;
    if config.secret_key == "dev-secret" {
        warn!("SECRET_KEY not set, using the development key");
    }

    let client = Arc::new(OrchestratorClient::new(
        config.orchestrator_url.clone(),
        config.orchestrator_ws_url.clone(),
        config.orchestrator_token.clone(),
        config.orchestrator_timeout,
    )?);
    let state = GatewayState {
        provisioner: client.clone(),
        terminal: client,
        verifier: Arc::new(JwtVerifier::new(&config.secret_key)),
        catalog: Arc::new(JsonChallengeCatalog::new(config.challenges_path.clone())),
        tickets: Arc::new(TicketStore::new(config.ticket_ttl)),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        addr = %config.bind_addr,
        orchestrator = %config.orchestrator_url,
        "Gateway listening"
    );
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
