//! Docker-backed [`ContainerRuntime`] on top of bollard.

use crate::bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use crate::bollard::errors::Error as BollardError;
use crate::bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use crate::bollard::image::CreateImageOptions;
use crate::bollard::models::{HostConfig, PortBinding, PortMap};
use crate::bollard::network::CreateNetworkOptions;
use crate::bollard::Docker;
use crate::{
    ContainerDetails, ContainerRecord, ContainerRuntime, ContainerSpec, ExecSession, ExecSpec,
    LabelFilter, NetworkSpec, Result, RuntimeError,
};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Connects using `DOCKER_HOST` or the platform's default socket.
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker)))
    }

    pub fn client(&self) -> Arc<Docker> {
        self.docker.clone()
    }
}

fn build_host_config(spec: &ContainerSpec) -> HostConfig {
    let mut port_bindings = PortMap::new();
    for port in &spec.published_ports {
        port_bindings.insert(
            format!("{port}/tcp"),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            }]),
        );
    }

    HostConfig {
        port_bindings: Some(port_bindings),
        binds: Some(spec.volumes.iter().map(|v| v.to_bind()).collect()),
        network_mode: Some(spec.network.clone()),
        nano_cpus: Some(spec.nano_cpus),
        memory: Some(spec.memory_bytes),
        pids_limit: Some(spec.pids_limit),
        cap_drop: Some(spec.cap_drop.clone()),
        cap_add: Some(spec.cap_add.clone()),
        security_opt: Some(spec.security_opt.clone()),
        ..Default::default()
    }
}

fn build_container_config(spec: &ContainerSpec) -> ContainerConfig<String> {
    let exposed_ports = spec
        .published_ports
        .iter()
        .map(|port| (format!("{port}/tcp"), HashMap::new()))
        .collect();

    ContainerConfig {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(build_host_config(spec)),
        ..Default::default()
    }
}

fn parse_port_bindings(ports: Option<&PortMap>) -> HashMap<String, Vec<u16>> {
    ports
        .map(|ports| {
            ports
                .iter()
                .map(|(key, bindings)| {
                    let host_ports = bindings
                        .iter()
                        .flatten()
                        .filter_map(|b| b.host_port.as_deref())
                        .filter_map(|p| p.parse::<u16>().ok())
                        .collect();
                    (key.clone(), host_ports)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Grace period in the engine's signed seconds, saturating.
fn stop_timeout_secs(grace: Duration) -> i64 {
    i64::try_from(grace.as_secs()).unwrap_or(i64::MAX)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        info!(%image, "Image not present locally, pulling");
        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    #[instrument(skip(self, spec), fields(network = %spec.name))]
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            internal: spec.internal,
            labels: spec.labels.clone(),
            ..Default::default()
        };
        self.docker.create_network(options).await?;
        debug!(network = %spec.name, "Network created");
        Ok(spec.name.clone())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker.remove_network(name).await?;
        debug!(network = %name, "Network removed");
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(create_options), build_container_config(spec))
            .await?;
        let container_id = created.id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            warn!(%container_id, error = %e, "Container start failed, removing");
            let remove_opts = Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            });
            if let Err(cleanup) = self.docker.remove_container(&container_id, remove_opts).await {
                warn!(%container_id, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(e.into());
        }

        info!(%container_id, "Container started");
        Ok(container_id)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let state = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_default();
        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let settings = inspect.network_settings.as_ref();
        let networks = settings
            .and_then(|s| s.networks.as_ref())
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();
        let port_bindings = parse_port_bindings(settings.and_then(|s| s.ports.as_ref()));

        Ok(ContainerDetails {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            state,
            labels,
            networks,
            port_bindings,
        })
    }

    async fn list_containers(&self, filters: &[LabelFilter]) -> Result<Vec<ContainerRecord>> {
        let mut docker_filters = HashMap::new();
        docker_filters.insert(
            "label".to_string(),
            filters.iter().map(LabelFilter::to_filter_string).collect::<Vec<_>>(),
        );
        let options = ListContainersOptions::<String> {
            all: true,
            filters: docker_filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        let records = containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let networks = c
                    .network_settings
                    .and_then(|s| s.networks)
                    .map(|n| n.into_keys().collect())
                    .unwrap_or_default();
                Some(ContainerRecord {
                    id,
                    labels: c.labels.unwrap_or_default(),
                    state: c.state.unwrap_or_default(),
                    networks,
                })
            })
            .collect();
        Ok(records)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: stop_timeout_secs(grace),
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            v: remove_volumes,
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    #[instrument(skip(self, spec), fields(container_id = %id))]
    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession> {
        let create = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            user: spec.user.clone(),
            env: Some(spec.env.clone()),
            tty: Some(spec.tty),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, create).await?;

        let start = StartExecOptions {
            detach: false,
            tty: spec.tty,
            output_capacity: None,
        };
        match self.docker.start_exec(&exec.id, Some(start)).await? {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map(|item| {
                        item.map(|log| log.into_bytes().to_vec())
                            .map_err(io::Error::other)
                    })
                    .boxed();
                Ok(ExecSession { output, input })
            }
            StartExecResults::Detached => Err(RuntimeError::Unexpected(
                "exec started detached".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VolumeMount;

    fn sample_spec() -> ContainerSpec {
        ContainerSpec {
            name: "ctf-0123456789ab".to_string(),
            image: "ctf/challenge01:latest".to_string(),
            env: vec!["PUBLIC_KEY=ssh-ed25519 AAAA".to_string()],
            labels: HashMap::from([("ctf.instance_id".to_string(), "abc".to_string())]),
            network: "ctf-net-0123456789ab".to_string(),
            published_ports: vec![2222],
            volumes: vec![VolumeMount {
                volume: "ctf-home-42-challenge01".to_string(),
                target: "/home/ctf".to_string(),
                read_only: false,
            }],
            nano_cpus: 500_000_000,
            memory_bytes: 256 * 1024 * 1024,
            pids_limit: 128,
            cap_drop: vec!["ALL".to_string()],
            cap_add: vec!["CHOWN".to_string(), "SETUID".to_string()],
            security_opt: vec!["seccomp=unconfined".to_string()],
        }
    }

    #[test]
    fn test_host_config_constraints() {
        let host = build_host_config(&sample_spec());
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.pids_limit, Some(128));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("ctf-net-0123456789ab"));
        assert_eq!(
            host.binds,
            Some(vec!["ctf-home-42-challenge01:/home/ctf:rw".to_string()])
        );

        let bindings = host.port_bindings.unwrap();
        let shell = bindings.get("2222/tcp").unwrap().as_ref().unwrap();
        assert_eq!(shell[0].host_port, None);
    }

    #[test]
    fn test_container_config_carries_labels() {
        let config = build_container_config(&sample_spec());
        assert_eq!(
            config.labels.unwrap().get("ctf.instance_id").map(String::as_str),
            Some("abc")
        );
        assert!(config.exposed_ports.unwrap().contains_key("2222/tcp"));
    }

    #[test]
    fn test_parse_port_bindings() {
        let mut ports = PortMap::new();
        ports.insert(
            "2222/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("49154".to_string()),
            }]),
        );
        ports.insert("80/tcp".to_string(), None);

        let parsed = parse_port_bindings(Some(&ports));
        assert_eq!(parsed.get("2222/tcp"), Some(&vec![49154]));
        assert_eq!(parsed.get("80/tcp"), Some(&vec![]));
        assert!(parse_port_bindings(None).is_empty());
    }

    #[test]
    fn test_stop_timeout_saturates() {
        assert_eq!(stop_timeout_secs(Duration::from_secs(10)), 10);
        assert_eq!(stop_timeout_secs(Duration::ZERO), 0);
        assert_eq!(stop_timeout_secs(Duration::MAX), i64::MAX);
    }
}
