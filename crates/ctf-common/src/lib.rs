// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

/// Runtime label keys. These labels are the only durable record of an
/// instance; everything else is derived from the container runtime.
pub mod labels {
    pub const INSTANCE_ID: &str = "ctf.instance_id";
    pub const OWNER_ID: &str = "ctf.user_id";
    pub const CHALLENGE_ID: &str = "ctf.challenge_id";
    pub const STARTED_AT: &str = "ctf.started_at";
}

#[derive(Error, Debug)]
pub enum CtfError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Instance {instance_id} is {status}")]
    NotRunning { instance_id: String, status: String },

    #[error("Instance already running: {0}")]
    AlreadyRunning(String),

    #[error("Resource Creation Failed: {0}")]
    ResourceCreation(String),

    #[error("Runtime Error: {0}")]
    Runtime(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Upstream Error: {0}")]
    Upstream(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CtfError>;

impl CtfError {
    /// HTTP status used when the error crosses an API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            CtfError::Unauthorized(_) => 401,
            CtfError::NotFound(_) | CtfError::NotRunning { .. } => 404,
            CtfError::AlreadyRunning(_) => 409,
            CtfError::BadRequest(_) => 400,
            CtfError::ResourceCreation(_) | CtfError::Upstream(_) => 502,
            CtfError::Timeout(_) => 504,
            CtfError::Runtime(_) | CtfError::Config(_) | CtfError::Io(_) | CtfError::Internal(_) => {
                500
            }
        }
    }

    /// Stable machine-readable code paired with [`CtfError::http_status`].
    pub fn code(&self) -> &'static str {
        match self {
            CtfError::Unauthorized(_) => "UNAUTHORIZED",
            CtfError::NotFound(_) | CtfError::NotRunning { .. } => "NOT_FOUND",
            CtfError::AlreadyRunning(_) => "CONFLICT",
            CtfError::BadRequest(_) => "BAD_REQUEST",
            CtfError::ResourceCreation(_) => "PROVISIONING_FAILED",
            CtfError::Upstream(_) => "UPSTREAM_ERROR",
            CtfError::Timeout(_) => "TIMEOUT",
            _ => "INTERNAL",
        }
    }

    /// Rebuilds an error from a status/code/message triple received from a peer service.
    pub fn from_remote(status: u16, code: &str, message: String) -> Self {
        match (status, code) {
            (401, _) => CtfError::Unauthorized(message),
            (404, _) => CtfError::NotFound(message),
            (409, _) => CtfError::AlreadyRunning(message),
            (400, _) => CtfError::BadRequest(message),
            (502, "PROVISIONING_FAILED") => CtfError::ResourceCreation(message),
            (504, _) => CtfError::Timeout(message),
            _ => CtfError::Upstream(message),
        }
    }
}

/// Header carrying the service-to-service shared secret.
pub const ORCH_TOKEN_HEADER: &str = "x-orch-token";

/// Lifecycle status of an instance. `Stopped` is terminal; reaping and an
/// explicit stop both end here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl InstanceStatus {
    /// Maps a container engine state string (`created`, `running`, `exited`, ...)
    /// onto the instance lifecycle.
    pub fn from_runtime_state(state: &str) -> Self {
        match state {
            "created" | "restarting" => InstanceStatus::Starting,
            "running" => InstanceStatus::Running,
            "paused" | "removing" => InstanceStatus::Stopping,
            _ => InstanceStatus::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One provisioned environment for one owner attempting one challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub owner_id: String,
    pub challenge_id: String,
    pub container_id: String,
    pub network: String,
    pub volume: String,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub host: String,
    /// Host port mapped to the guest shell port. `None` until the runtime
    /// reports a mapping.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub challenge_id: String,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartInstanceRequest {
    pub image: String,
    #[serde(alias = "user_id")]
    pub owner_id: String,
    pub challenge_id: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl StartInstanceRequest {
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty()
            || self.owner_id.trim().is_empty()
            || self.challenge_id.trim().is_empty()
        {
            return Err(CtfError::BadRequest("missing fields".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedInstance {
    pub instance_id: String,
    pub container_id: String,
    pub host: String,
    pub port: Option<u16>,
}

impl From<&Instance> for StartedInstance {
    fn from(instance: &Instance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            container_id: instance.container_id.clone(),
            host: instance.host.clone(),
            port: instance.port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopInstanceRequest {
    pub instance_id: String,
}

impl StopInstanceRequest {
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(CtfError::BadRequest("missing instance_id".to_string()));
        }
        Ok(())
    }
}

/// Authenticated principal returned by a [`TokenVerifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.subject)
    }
}

/// Challenge catalog entry. Only `image` is consumed by the provisioning path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub image: String,
    #[serde(default)]
    pub flag: Option<String>,
}

/// Start/stop/list surface shared by the in-process lifecycle manager and
/// the HTTP client that talks to it from another process.
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    async fn start(&self, request: StartInstanceRequest) -> Result<StartedInstance>;

    /// Idempotent: stopping an unknown instance succeeds.
    async fn stop(&self, instance_id: &str) -> Result<()>;

    async fn list(&self, owner_id: &str) -> Result<Vec<InstanceSummary>>;
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity>;
}

#[async_trait]
pub trait ChallengeCatalog: Send + Sync {
    async fn lookup(&self, challenge_id: &str) -> Result<Option<Challenge>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let summary = InstanceSummary {
            instance_id: uuid::Uuid::new_v4().to_string(),
            challenge_id: "challenge01".to_string(),
            status: InstanceStatus::Running,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"status\":\"running\""));

        let back: InstanceSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }

    #[test]
    fn test_instance_serialization_fields() {
        let instance = Instance {
            id: "inst-1".to_string(),
            owner_id: "42".to_string(),
            challenge_id: "challenge01".to_string(),
            container_id: "c0ffee".to_string(),
            network: "ctf-net-inst-1".to_string(),
            volume: "ctf-home-42-challenge01".to_string(),
            status: InstanceStatus::Running,
            started_at: Utc::now(),
            host: "127.0.0.1".to_string(),
            port: None,
        };
        let value = serde_json::to_value(&instance).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            [
                "challenge_id",
                "container_id",
                "host",
                "id",
                "network",
                "owner_id",
                "port",
                "started_at",
                "status",
                "volume",
            ]
        );
        assert!(value["port"].is_null());
    }

    #[test]
    fn test_runtime_state_mapping() {
        assert_eq!(InstanceStatus::from_runtime_state("created"), InstanceStatus::Starting);
        assert_eq!(InstanceStatus::from_runtime_state("running"), InstanceStatus::Running);
        assert_eq!(InstanceStatus::from_runtime_state("removing"), InstanceStatus::Stopping);
        assert_eq!(InstanceStatus::from_runtime_state("exited"), InstanceStatus::Stopped);
        assert_eq!(InstanceStatus::from_runtime_state("dead"), InstanceStatus::Stopped);
        assert!(!InstanceStatus::Stopped.is_running());
    }

    #[test]
    fn test_start_request_validation() {
        let mut req = StartInstanceRequest {
            image: "ctf/challenge01:latest".to_string(),
            owner_id: "42".to_string(),
            challenge_id: "challenge01".to_string(),
            public_key: None,
        };
        assert!(req.validate().is_ok());

        req.image = "  ".to_string();
        assert!(matches!(req.validate(), Err(CtfError::BadRequest(_))));
    }

    #[test]
    fn test_error_http_mapping() {
        let err = CtfError::NotRunning {
            instance_id: "abc".to_string(),
            status: "exited".to_string(),
        };
        assert_eq!(err.http_status(), 404);
        assert_eq!(err.to_string(), "Instance abc is exited");
        assert_eq!(CtfError::AlreadyRunning("x".into()).http_status(), 409);
        assert_eq!(CtfError::ResourceCreation("x".into()).code(), "PROVISIONING_FAILED");

        let back = CtfError::from_remote(502, "PROVISIONING_FAILED", "no network".to_string());
        assert!(matches!(back, CtfError::ResourceCreation(_)));
        let back = CtfError::from_remote(500, "INTERNAL", "boom".to_string());
        assert!(matches!(back, CtfError::Upstream(_)));
    }

    #[test]
    fn test_start_request_accepts_user_id_alias() {
        let req: StartInstanceRequest = serde_json::from_str(
            r#"{"image":"img","user_id":"7","challenge_id":"c1","public_key":"ssh-ed25519 AAAA"}"#,
        )
        .unwrap();
        assert_eq!(req.owner_id, "7");
    }

    #[test]
    fn test_start_request_public_key_optional() {
        let req: StartInstanceRequest = serde_json::from_str(
            r#"{"image":"img","owner_id":"7","challenge_id":"c1"}"#,
        )
        .unwrap();
        assert_eq!(req.public_key, None);
    }
}
