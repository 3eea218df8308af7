use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use ctf_common::CtfError;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

// Re-export dependencies potentially needed by consumers (like the orchestrator)
pub use bollard;
pub use ctf_common as common;

pub mod docker;
pub mod mock;
pub mod test_utils;

pub use docker::DockerRuntime;
pub use mock::{MockRuntime, MockShell};

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[source] BollardError),
    #[error("Runtime call timed out: {0}")]
    Timeout(String),
    #[error("Unexpected runtime response: {0}")]
    Unexpected(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<BollardError> for RuntimeError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::DockerApi(other),
        }
    }
}

impl From<RuntimeError> for CtfError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(what) => CtfError::NotFound(what),
            RuntimeError::Timeout(op) => CtfError::Timeout(op),
            other => CtfError::Runtime(other.to_string()),
        }
    }
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Label predicate used when listing containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelFilter {
    /// The label key is present, whatever its value.
    Present(String),
    Equals(String, String),
}

impl LabelFilter {
    pub fn present(key: &str) -> Self {
        LabelFilter::Present(key.to_string())
    }

    pub fn equals(key: &str, value: &str) -> Self {
        LabelFilter::Equals(key.to_string(), value.to_string())
    }

    /// Docker `label` filter syntax.
    pub fn to_filter_string(&self) -> String {
        match self {
            LabelFilter::Present(key) => key.clone(),
            LabelFilter::Equals(key, value) => format!("{key}={value}"),
        }
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        match self {
            LabelFilter::Present(key) => labels.contains_key(key),
            LabelFilter::Equals(key, value) => labels.get(key) == Some(value),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkSpec {
    pub name: String,
    /// No outbound connectivity when set.
    pub internal: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn to_bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.volume, self.target, mode)
    }
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub network: String,
    /// Guest TCP ports published on ephemeral host ports.
    pub published_ports: Vec<u16>,
    pub volumes: Vec<VolumeMount>,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
}

/// A container as reported by a list call.
#[derive(Debug, Clone, Default)]
pub struct ContainerRecord {
    pub id: String,
    pub labels: HashMap<String, String>,
    /// Engine state string (`running`, `exited`, ...).
    pub state: String,
    pub networks: Vec<String>,
}

/// A container as reported by inspect.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub id: String,
    pub state: String,
    pub labels: HashMap<String, String>,
    pub networks: Vec<String>,
    /// `"<port>/tcp"` -> host ports
    pub port_bindings: HashMap<String, Vec<u16>>,
}

impl ContainerDetails {
    pub fn host_port(&self, guest_port: u16) -> Option<u16> {
        self.port_bindings
            .get(&format!("{guest_port}/tcp"))
            .and_then(|ports| ports.first().copied())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub env: Vec<String>,
}

/// Interactive command channel inside a running container.
pub struct ExecSession {
    pub output: BoxStream<'static, io::Result<Vec<u8>>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

const PIPE_READ_CHUNK: usize = 4096;

impl ExecSession {
    /// Builds a session from a plain reader/writer pair.
    pub fn from_pipes<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let output = futures::stream::unfold(reader, |mut reader| async move {
            let mut buf = vec![0u8; PIPE_READ_CHUNK];
            match reader.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf), reader))
                }
                Err(e) => Some((Err(e), reader)),
            }
        })
        .boxed();
        Self {
            output,
            input: Box::pin(writer),
        }
    }
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession").finish_non_exhaustive()
    }
}

/// Capability wrapper around a container engine's control API.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Pulls `image` when it is not present locally.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Creates and starts a container, returning its runtime id. Labels are
    /// part of the create call.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// Lists containers in any state matching all `filters`.
    async fn list_containers(&self, filters: &[LabelFilter]) -> Result<Vec<ContainerRecord>>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<()>;

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession>;
}
