//! HTTP and websocket client for the orchestrator service.

use async_trait::async_trait;
use ctf_common::{
    CtfError, InstanceProvisioner, InstanceSummary, Result, StartInstanceRequest,
    StartedInstance, StopInstanceRequest, ORCH_TOKEN_HEADER,
};
use ctf_relay::Endpoint;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::HeaderValue};
use tracing::{debug, instrument};

/// Opens the next terminal hop for an instance.
#[async_trait]
pub trait TerminalUpstream: Send + Sync {
    async fn connect(&self, instance_id: &str) -> Result<Endpoint>;
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    error: String,
    code: String,
}

#[derive(Clone)]
pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: String,
    timeout: Duration,
}

fn transport_error(err: reqwest::Error) -> CtfError {
    if err.is_timeout() {
        CtfError::Timeout(format!("orchestrator request: {err}"))
    } else {
        CtfError::Upstream(format!("orchestrator unreachable: {err}"))
    }
}

impl OrchestratorClient {
    pub fn new(
        base_url: impl Into<String>,
        ws_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CtfError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            ws_url: ws_url.into(),
            token: token.into(),
            timeout,
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| CtfError::Upstream(format!("invalid orchestrator response: {e}")));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(CtfError::Upstream(
                "orchestrator rejected the service token".to_string(),
            ));
        }
        match response.json::<RemoteError>().await {
            Ok(remote) => Err(CtfError::from_remote(
                status.as_u16(),
                &remote.code,
                remote.error,
            )),
            Err(_) => Err(CtfError::Upstream(format!("orchestrator returned {status}"))),
        }
    }
}

#[async_trait]
impl InstanceProvisioner for OrchestratorClient {
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id, challenge_id = %request.challenge_id))]
    async fn start(&self, request: StartInstanceRequest) -> Result<StartedInstance> {
        let response = self
            .http
            .post(format!("{}/instances/start", self.base_url))
            .header(ORCH_TOKEN_HEADER, &self.token)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(response).await
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/instances/stop", self.base_url))
            .header(ORCH_TOKEN_HEADER, &self.token)
            .json(&StopInstanceRequest {
                instance_id: instance_id.to_string(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode::<serde_json::Value>(response).await.map(|_| ())
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<InstanceSummary>> {
        let response = self
            .http
            .get(format!("{}/instances", self.base_url))
            .header(ORCH_TOKEN_HEADER, &self.token)
            .query(&[("owner_id", owner_id)])
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(response).await
    }
}

#[async_trait]
impl TerminalUpstream for OrchestratorClient {
    async fn connect(&self, instance_id: &str) -> Result<Endpoint> {
        let url = format!("{}/ws/terminal/{instance_id}", self.ws_url);
        let mut request = url
            .into_client_request()
            .map_err(|e| CtfError::Upstream(format!("terminal url: {e}")))?;
        let token = HeaderValue::from_str(&self.token)
            .map_err(|e| CtfError::Config(format!("orchestrator token: {e}")))?;
        request.headers_mut().insert(ORCH_TOKEN_HEADER, token);

        let (stream, _) = tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| CtfError::Timeout("terminal upstream handshake".to_string()))?
            .map_err(|e| CtfError::Upstream(format!("terminal upstream: {e}")))?;
        debug!(%instance_id, "Connected terminal upstream");
        Ok(Endpoint::from_tungstenite(stream))
    }
}
