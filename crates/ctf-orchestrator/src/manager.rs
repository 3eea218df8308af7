//! Instance lifecycle on top of a [`ContainerRuntime`].
//!
//! Nothing is cached here: every lookup is a label query against the
//! runtime, so any process holding a runtime handle can list, stop or attach
//! to instances started by another.

use crate::config::OrchestratorConfig;
use crate::policy::{ResourceLimits, SecurityPolicy};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use ctf_common::{
    labels, CtfError, Instance, InstanceProvisioner, InstanceStatus, InstanceSummary, Result,
    StartInstanceRequest, StartedInstance,
};
use ctf_runtime::{
    ContainerRecord, ContainerRuntime, ContainerSpec, ExecSession, ExecSpec, LabelFilter,
    NetworkSpec, RuntimeError, VolumeMount,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Guest port the interactive shell service listens on.
pub const SHELL_PORT: u16 = 2222;
pub const SHELL_USER: &str = "ctf";
pub const HOME_DIR: &str = "/home/ctf";
pub const NETWORK_PREFIX: &str = "ctf-net-";
pub const CONTAINER_PREFIX: &str = "ctf-";
pub const VOLUME_PREFIX: &str = "ctf-home-";

const SHORT_ID_LEN: usize = 12;

fn short_id(instance_id: &str) -> &str {
    match instance_id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &instance_id[..idx],
        None => instance_id,
    }
}

pub fn network_name(instance_id: &str) -> String {
    format!("{NETWORK_PREFIX}{}", short_id(instance_id))
}

pub fn container_name(instance_id: &str) -> String {
    format!("{CONTAINER_PREFIX}{}", short_id(instance_id))
}

/// Home volume for an (owner, challenge) pair. Stable across restarts.
pub fn volume_name(owner_id: &str, challenge_id: &str) -> String {
    format!(
        "{VOLUME_PREFIX}{}-{}",
        sanitize(owner_id),
        sanitize(challenge_id)
    )
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn format_started_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Accepts RFC 3339 and offset-less ISO-8601 timestamps, the latter read as UTC.
pub fn parse_started_at(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// A runtime container carrying the instance labels.
#[derive(Debug, Clone)]
pub struct TaggedContainer {
    pub instance_id: String,
    pub owner_id: String,
    pub challenge_id: String,
    pub container_id: String,
    /// `None` when the label is missing or unparseable.
    pub started_at: Option<DateTime<Utc>>,
    /// Raw engine state.
    pub state: String,
    pub status: InstanceStatus,
    pub networks: Vec<String>,
}

impl TaggedContainer {
    fn from_record(record: ContainerRecord) -> Option<Self> {
        let label = |key: &str| record.labels.get(key).cloned().unwrap_or_default();
        let instance_id = record.labels.get(labels::INSTANCE_ID)?.clone();
        Some(Self {
            owner_id: label(labels::OWNER_ID),
            challenge_id: label(labels::CHALLENGE_ID),
            started_at: record
                .labels
                .get(labels::STARTED_AT)
                .and_then(|v| parse_started_at(v)),
            status: InstanceStatus::from_runtime_state(&record.state),
            instance_id,
            container_id: record.id,
            state: record.state,
            networks: record.networks,
        })
    }

    /// The instance's dedicated network, falling back to the derived name.
    pub fn network(&self) -> String {
        self.networks
            .iter()
            .find(|n| n.starts_with(NETWORK_PREFIX))
            .cloned()
            .unwrap_or_else(|| network_name(&self.instance_id))
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            instance_id: self.instance_id.clone(),
            challenge_id: self.challenge_id.clone(),
            status: self.status,
        }
    }
}

#[derive(Clone)]
pub struct InstanceManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<OrchestratorConfig>,
    policy: Arc<SecurityPolicy>,
}

impl InstanceManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: OrchestratorConfig,
        policy: SecurityPolicy,
    ) -> Self {
        Self {
            runtime,
            config: Arc::new(config),
            policy: Arc::new(policy),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    async fn bounded<T, F>(&self, op: &str, limit: Duration, fut: F) -> ctf_runtime::Result<T>
    where
        F: Future<Output = ctf_runtime::Result<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(format!(
                "{op} exceeded {}s",
                limit.as_secs()
            ))),
        }
    }

    fn request_timeout(&self) -> Duration {
        self.config.runtime_timeout
    }

    fn instance_labels(
        instance_id: &str,
        request: &StartInstanceRequest,
        started_at: DateTime<Utc>,
    ) -> HashMap<String, String> {
        HashMap::from([
            (labels::INSTANCE_ID.to_string(), instance_id.to_string()),
            (labels::OWNER_ID.to_string(), request.owner_id.clone()),
            (labels::CHALLENGE_ID.to_string(), request.challenge_id.clone()),
            (labels::STARTED_AT.to_string(), format_started_at(started_at)),
        ])
    }

    fn container_spec(
        &self,
        instance_id: &str,
        request: &StartInstanceRequest,
        labels: HashMap<String, String>,
        network: &str,
        volume: &str,
    ) -> ContainerSpec {
        let limits = ResourceLimits::from(self.config.as_ref());
        let env = vec![format!(
            "PUBLIC_KEY={}",
            request.public_key.as_deref().unwrap_or_default()
        )];
        ContainerSpec {
            name: container_name(instance_id),
            image: request.image.clone(),
            env,
            labels,
            network: network.to_string(),
            published_ports: vec![SHELL_PORT],
            volumes: vec![VolumeMount {
                volume: volume.to_string(),
                target: HOME_DIR.to_string(),
                read_only: false,
            }],
            nano_cpus: limits.nano_cpus,
            memory_bytes: limits.memory_bytes,
            pids_limit: limits.pids_limit,
            cap_drop: self.policy.cap_drop.clone(),
            cap_add: self.policy.cap_add.clone(),
            security_opt: self.policy.security_opts(),
        }
    }

    /// Provisions network, volume and container for one attempt at a challenge.
    #[instrument(skip(self, request), fields(owner_id = %request.owner_id, challenge_id = %request.challenge_id))]
    pub async fn start(&self, request: StartInstanceRequest) -> Result<Instance> {
        request.validate()?;
        let timeout = self.request_timeout();

        if !self.config.allow_multiple_instances {
            let filters = [
                LabelFilter::equals(labels::OWNER_ID, &request.owner_id),
                LabelFilter::equals(labels::CHALLENGE_ID, &request.challenge_id),
            ];
            let existing = self
                .bounded("list_containers", timeout, self.runtime.list_containers(&filters))
                .await?;
            if let Some(active) = existing
                .into_iter()
                .filter_map(TaggedContainer::from_record)
                .find(|c| c.status != InstanceStatus::Stopped)
            {
                return Err(CtfError::AlreadyRunning(active.instance_id));
            }
        }

        let instance_id = Uuid::new_v4().to_string();
        let network = network_name(&instance_id);
        let volume = volume_name(&request.owner_id, &request.challenge_id);
        let started_at = Utc::now();
        let labels = Self::instance_labels(&instance_id, &request, started_at);

        self.bounded("ensure_image", timeout, self.runtime.ensure_image(&request.image))
            .await
            .map_err(|e| CtfError::ResourceCreation(format!("image {}: {e}", request.image)))?;

        let network_spec = NetworkSpec {
            name: network.clone(),
            internal: true,
            labels: HashMap::from([
                (labels::INSTANCE_ID.to_string(), instance_id.clone()),
                (labels::OWNER_ID.to_string(), request.owner_id.clone()),
            ]),
        };
        self.bounded("create_network", timeout, self.runtime.create_network(&network_spec))
            .await
            .map_err(|e| CtfError::ResourceCreation(format!("network {network}: {e}")))?;

        let spec = self.container_spec(&instance_id, &request, labels, &network, &volume);
        let container_id = match self
            .bounded("run_container", timeout, self.runtime.run_container(&spec))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(%instance_id, error = %e, "Container creation failed");
                self.rollback_network(&network).await;
                return Err(CtfError::ResourceCreation(format!("container: {e}")));
            }
        };

        let port = match self
            .bounded("inspect_container", timeout, self.runtime.inspect_container(&container_id))
            .await
        {
            Ok(details) => details.host_port(SHELL_PORT),
            Err(e) => {
                warn!(%container_id, error = %e, "Inspect after start failed");
                None
            }
        };
        if port.is_none() {
            warn!(%instance_id, "No host port reported for shell port {SHELL_PORT}");
        }

        info!(%instance_id, %container_id, ?port, "Instance started");
        Ok(Instance {
            id: instance_id,
            owner_id: request.owner_id,
            challenge_id: request.challenge_id,
            container_id,
            network,
            volume,
            status: InstanceStatus::Running,
            started_at,
            host: self.config.instance_host.clone(),
            port,
        })
    }

    async fn rollback_network(&self, network: &str) {
        match self
            .bounded("remove_network", self.request_timeout(), self.runtime.remove_network(network))
            .await
        {
            Ok(()) => debug!(%network, "Rolled back network"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%network, error = %e, "Network rollback failed"),
        }
    }

    /// Stops and removes the instance. Returns `false` when nothing carried the
    /// id, which callers treat as success.
    #[instrument(skip(self))]
    pub async fn stop(&self, instance_id: &str) -> Result<bool> {
        let filters = [LabelFilter::equals(labels::INSTANCE_ID, instance_id)];
        let records = self
            .bounded("list_containers", self.request_timeout(), self.runtime.list_containers(&filters))
            .await?;
        let tagged: Vec<_> = records
            .into_iter()
            .filter_map(TaggedContainer::from_record)
            .collect();
        if tagged.is_empty() {
            debug!("No container for instance, nothing to stop");
            return Ok(false);
        }
        for container in &tagged {
            self.teardown(container).await?;
        }
        info!(%instance_id, "Instance stopped");
        Ok(true)
    }

    /// Container first, network last: an attached network cannot be removed.
    async fn teardown(&self, container: &TaggedContainer) -> Result<()> {
        let id = &container.container_id;
        let stop_limit = self.request_timeout().saturating_add(self.config.stop_grace);

        match self
            .bounded("stop_container", stop_limit, self.runtime.stop_container(id, self.config.stop_grace))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(container_id = %id, "Container already gone"),
            Err(e) => return Err(e.into()),
        }

        match self
            .bounded("remove_container", self.request_timeout(), self.runtime.remove_container(id, true))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let network = container.network();
        match self
            .bounded("remove_network", self.request_timeout(), self.runtime.remove_network(&network))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(%network, "Network already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Instances owned by `owner_id`, in runtime listing order.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<InstanceSummary>> {
        let filters = [
            LabelFilter::present(labels::INSTANCE_ID),
            LabelFilter::equals(labels::OWNER_ID, owner_id),
        ];
        let records = self
            .bounded("list_containers", self.request_timeout(), self.runtime.list_containers(&filters))
            .await?;
        Ok(records
            .into_iter()
            .filter_map(TaggedContainer::from_record)
            .filter(|c| c.owner_id == owner_id)
            .map(|c| c.summary())
            .collect())
    }

    /// Every tagged container across all owners.
    pub async fn list_tagged(&self) -> Result<Vec<TaggedContainer>> {
        let filters = [LabelFilter::present(labels::INSTANCE_ID)];
        let records = self
            .bounded("list_containers", self.request_timeout(), self.runtime.list_containers(&filters))
            .await?;
        Ok(records
            .into_iter()
            .filter_map(TaggedContainer::from_record)
            .collect())
    }

    pub async fn find(&self, instance_id: &str) -> Result<Option<TaggedContainer>> {
        let filters = [LabelFilter::equals(labels::INSTANCE_ID, instance_id)];
        let records = self
            .bounded("list_containers", self.request_timeout(), self.runtime.list_containers(&filters))
            .await?;
        Ok(records
            .into_iter()
            .filter_map(TaggedContainer::from_record)
            .find(|c| c.instance_id == instance_id))
    }

    /// Opens a login shell inside a running instance.
    #[instrument(skip(self))]
    pub async fn attach_shell(&self, instance_id: &str) -> Result<ExecSession> {
        let container = self
            .find(instance_id)
            .await?
            .ok_or_else(|| CtfError::NotFound(format!("instance {instance_id}")))?;
        if !container.status.is_running() {
            return Err(CtfError::NotRunning {
                instance_id: instance_id.to_string(),
                status: container.state,
            });
        }

        let exec = ExecSpec {
            cmd: vec!["/bin/bash".to_string(), "-l".to_string()],
            user: Some(SHELL_USER.to_string()),
            tty: true,
            env: vec!["TERM=xterm-256color".to_string()],
        };
        let session = self
            .bounded("exec", self.request_timeout(), self.runtime.exec(&container.container_id, &exec))
            .await?;
        info!(container_id = %container.container_id, "Shell attached");
        Ok(session)
    }
}

#[async_trait]
impl InstanceProvisioner for InstanceManager {
    async fn start(&self, request: StartInstanceRequest) -> Result<StartedInstance> {
        let instance = InstanceManager::start(self, request).await?;
        Ok(StartedInstance::from(&instance))
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        InstanceManager::stop(self, instance_id).await.map(|_| ())
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<InstanceSummary>> {
        InstanceManager::list(self, owner_id).await
    }
}
