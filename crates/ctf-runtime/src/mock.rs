//! In-memory [`ContainerRuntime`] that mirrors the Docker semantics the
//! lifecycle code depends on: label filtering, attached-network removal
//! refusal, 404s on missing resources and interactive exec channels.

use crate::{
    ContainerDetails, ContainerRecord, ContainerRuntime, ContainerSpec, ExecSession, ExecSpec,
    LabelFilter, NetworkSpec, Result, RuntimeError,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_HOST_PORT: u16 = 49152;

/// Shell side of an exec channel opened against the mock.
pub struct MockShell {
    pub container_id: String,
    pub spec: ExecSpec,
    /// Bytes written by the client arrive here.
    pub stdin: DuplexStream,
    /// Bytes written here reach the client.
    pub stdout: DuplexStream,
}

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub state: String,
    pub host_port: Option<u16>,
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    networks: HashMap<String, NetworkSpec>,
    volumes: HashSet<String>,
    calls: Vec<String>,
    fail_stop: HashSet<String>,
    fail_run: bool,
    map_ports: bool,
    next_port: u16,
    next_id: u64,
}

impl MockState {
    fn record(&mut self, call: String) {
        self.calls.push(call);
    }

    fn container(&self, id: &str) -> Result<&MockContainer> {
        self.containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {id}")))
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut MockContainer> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {id}")))
    }
}

pub struct MockRuntime {
    state: Mutex<MockState>,
    shells_tx: mpsc::UnboundedSender<MockShell>,
    shells_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockShell>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        let (shells_tx, shells_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockState {
                map_ports: true,
                next_port: FIRST_HOST_PORT,
                ..Default::default()
            }),
            shells_tx,
            shells_rx: tokio::sync::Mutex::new(shells_rx),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Containers start without a published host port.
    pub fn without_port_mapping(self) -> Self {
        self.lock().map_ports = false;
        self
    }

    pub fn fail_container_creation(&self, fail: bool) {
        self.lock().fail_run = fail;
    }

    pub fn fail_stop_for(&self, container_id: &str) {
        self.lock().fail_stop.insert(container_id.to_string());
    }

    /// Seeds a container directly, bypassing `run_container` and the call log.
    pub fn insert_container(&self, labels: HashMap<String, String>, state: &str) -> String {
        let mut st = self.lock();
        st.next_id += 1;
        let id = format!("seeded{:012x}", st.next_id);
        st.containers.push(MockContainer {
            id: id.clone(),
            spec: ContainerSpec {
                name: id.clone(),
                labels,
                ..Default::default()
            },
            state: state.to_string(),
            host_port: None,
        });
        id
    }

    pub fn set_state(&self, container_id: &str, state: &str) {
        if let Ok(container) = self.lock().container_mut(container_id) {
            container.state = state.to_string();
        }
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.lock().containers.clone()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.lock().networks.keys().cloned().collect()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.lock().volumes.iter().cloned().collect()
    }

    /// Every runtime call in order, formatted as `"<operation>:<target>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls that create, stop or remove runtime resources.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                c.starts_with("create_")
                    || c.starts_with("run_")
                    || c.starts_with("stop_")
                    || c.starts_with("remove_")
            })
            .collect()
    }

    /// Waits for the next exec channel opened against this runtime.
    pub async fn next_shell(&self) -> Option<MockShell> {
        self.shells_rx.lock().await.recv().await
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.lock().record(format!("ensure_image:{image}"));
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let mut st = self.lock();
        st.record(format!("create_network:{}", spec.name));
        if st.networks.contains_key(&spec.name) {
            return Err(RuntimeError::Unexpected(format!(
                "network with name {} already exists",
                spec.name
            )));
        }
        st.networks.insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut st = self.lock();
        st.record(format!("remove_network:{name}"));
        if st.containers.iter().any(|c| c.spec.network == name) {
            return Err(RuntimeError::Unexpected(format!(
                "network {name} has active endpoints"
            )));
        }
        st.networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(format!("network {name} not found")))
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut st = self.lock();
        st.record(format!("run_container:{}", spec.name));
        if st.fail_run {
            return Err(RuntimeError::Unexpected("simulated create failure".to_string()));
        }
        if !st.networks.contains_key(&spec.network) {
            return Err(RuntimeError::NotFound(format!(
                "network {} not found",
                spec.network
            )));
        }

        st.next_id += 1;
        let id = format!("{:064x}", st.next_id);
        let host_port = if st.map_ports && !spec.published_ports.is_empty() {
            let port = st.next_port;
            st.next_port += 1;
            Some(port)
        } else {
            None
        };
        for mount in &spec.volumes {
            st.volumes.insert(mount.volume.clone());
        }
        st.containers.push(MockContainer {
            id: id.clone(),
            spec: spec.clone(),
            state: "running".to_string(),
            host_port,
        });
        Ok(id)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let st = self.lock();
        let container = st.container(id)?;
        let port_bindings = match (container.host_port, container.spec.published_ports.first()) {
            (Some(host), Some(guest)) => HashMap::from([(format!("{guest}/tcp"), vec![host])]),
            _ => HashMap::new(),
        };
        Ok(ContainerDetails {
            id: container.id.clone(),
            state: container.state.clone(),
            labels: container.spec.labels.clone(),
            networks: vec![container.spec.network.clone()]
                .into_iter()
                .filter(|n| !n.is_empty())
                .collect(),
            port_bindings,
        })
    }

    async fn list_containers(&self, filters: &[LabelFilter]) -> Result<Vec<ContainerRecord>> {
        let st = self.lock();
        Ok(st
            .containers
            .iter()
            .filter(|c| filters.iter().all(|f| f.matches(&c.spec.labels)))
            .map(|c| ContainerRecord {
                id: c.id.clone(),
                labels: c.spec.labels.clone(),
                state: c.state.clone(),
                networks: vec![c.spec.network.clone()]
                    .into_iter()
                    .filter(|n| !n.is_empty())
                    .collect(),
            })
            .collect())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut st = self.lock();
        st.record(format!("stop_container:{id}"));
        if st.fail_stop.contains(id) {
            return Err(RuntimeError::Unexpected("simulated stop failure".to_string()));
        }
        st.container_mut(id)?.state = "exited".to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str, _remove_volumes: bool) -> Result<()> {
        let mut st = self.lock();
        st.record(format!("remove_container:{id}"));
        let before = st.containers.len();
        st.containers.retain(|c| c.id != id);
        if st.containers.len() == before {
            return Err(RuntimeError::NotFound(format!("No such container: {id}")));
        }
        Ok(())
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession> {
        {
            let mut st = self.lock();
            st.record(format!("exec:{id}"));
            let container = st.container(id)?;
            if container.state != "running" {
                return Err(RuntimeError::Unexpected(format!(
                    "container {id} is not running"
                )));
            }
        }

        let (client_in, shell_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (shell_stdout, client_out) = tokio::io::duplex(PIPE_CAPACITY);
        let shell = MockShell {
            container_id: id.to_string(),
            spec: spec.clone(),
            stdin: shell_stdin,
            stdout: shell_stdout,
        };
        self.shells_tx
            .send(shell)
            .map_err(|_| RuntimeError::Unexpected("shell receiver dropped".to_string()))?;
        Ok(ExecSession::from_pipes(client_out, client_in))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn spec(name: &str, network: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "alpine".to_string(),
            network: network.to_string(),
            published_ports: vec![2222],
            labels: HashMap::from([("ctf.instance_id".to_string(), name.to_string())]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_network_removal_refused_while_attached() {
        let runtime = MockRuntime::new();
        runtime
            .create_network(&NetworkSpec {
                name: "net-a".to_string(),
                internal: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let id = runtime.run_container(&spec("a", "net-a")).await.unwrap();

        assert!(runtime.remove_network("net-a").await.is_err());
        runtime.remove_container(&id, true).await.unwrap();
        runtime.remove_network("net-a").await.unwrap();
        assert!(runtime.remove_network("net-a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_label() {
        let runtime = MockRuntime::new();
        runtime.insert_container(
            HashMap::from([("ctf.user_id".to_string(), "1".to_string())]),
            "running",
        );
        runtime.insert_container(
            HashMap::from([("ctf.user_id".to_string(), "2".to_string())]),
            "running",
        );

        let listed = runtime
            .list_containers(&[LabelFilter::equals("ctf.user_id", "2")])
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].labels["ctf.user_id"], "2");
    }

    #[tokio::test]
    async fn test_exec_channel_round_trip() {
        let runtime = MockRuntime::new();
        runtime
            .create_network(&NetworkSpec {
                name: "net-b".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let id = runtime.run_container(&spec("b", "net-b")).await.unwrap();

        let mut session = runtime.exec(&id, &ExecSpec::default()).await.unwrap();
        let mut shell = runtime.next_shell().await.unwrap();

        session.input.write_all(b"id\n").await.unwrap();
        let mut buf = [0u8; 3];
        shell.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"id\n");

        shell.stdout.write_all(b"uid=1000(ctf)").await.unwrap();
        let chunk = session.output.next().await.unwrap().unwrap();
        assert_eq!(chunk, b"uid=1000(ctf)");
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let runtime = MockRuntime::new();
        let id = runtime.insert_container(HashMap::new(), "exited");
        assert!(runtime.exec(&id, &ExecSpec::default()).await.is_err());
    }
}
