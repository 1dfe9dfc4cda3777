//! Shared test infrastructure for potkeeper-core integration tests.
//!
//! In-memory stand-ins for the docker runtime and the capture backend.
//!
//! ```ignore
//! mod common;
//! use common::{FakeCapture, FakeRuntime};
//! ```

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use potkeeper_core::capture::pcap::LINKTYPE_ETHERNET;
use potkeeper_core::capture::{CaptureBackend, CaptureParams, CapturedPacket, PacketStream};
use potkeeper_core::docker::{ChangeKind, ContainerRuntime, ContainerSpec, FsChange};
use potkeeper_core::error::{CaptureError, DockerError, Result};
use potkeeper_core::pot::{ContainerInfo, EndpointSettings, PortMapping, PotNetwork};
use tokio::sync::Semaphore;

pub const LABEL: &str = "pot.name";

/// Runtime operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ListNetworks,
    ListContainers,
    Logs,
    Diff,
    Top,
    Commit,
    Save,
    Create,
    Start,
    Remove,
    Rename,
}

#[derive(Default)]
struct FakeState {
    networks: Vec<PotNetwork>,
    containers: BTreeMap<String, ContainerInfo>,
    images: HashSet<String>,
    failures: HashSet<FailPoint>,
    daemon_down: bool,
    calls: Vec<String>,
}

/// In-memory [`ContainerRuntime`]
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    next_id: AtomicU64,
    next_slot: AtomicU16,
    commit_gate: Mutex<Option<Arc<Semaphore>>>,
}

fn fake_error(point: FailPoint) -> potkeeper_core::Error {
    DockerError::CommandFailed(format!("injected {point:?} failure")).into()
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}{n:016x}")
    }

    /// Add a pot network and return its id.
    pub fn add_network(&self, pot: &str) -> String {
        let id = format!("{:0<24}", format!("net{pot}"));
        let mut labels = HashMap::new();
        labels.insert(LABEL.to_string(), pot.to_string());
        self.state.lock().unwrap().networks.push(PotNetwork {
            id: id.clone(),
            name: format!("{pot}_net"),
            pot: pot.to_string(),
            labels,
            options: HashMap::new(),
        });
        id
    }

    pub fn remove_network(&self, pot: &str) {
        self.state.lock().unwrap().networks.retain(|net| net.pot != pot);
    }

    /// Add a running container to `pot` and return its id.
    ///
    /// Every container gets its own published host port and static address,
    /// which its clean clone inherits.
    pub fn add_container(&self, pot: &str, name: &str) -> String {
        let id = self.fresh_id("dirty");
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let mut labels = HashMap::new();
        labels.insert(LABEL.to_string(), pot.to_string());
        labels.insert("role".to_string(), name.to_string());
        let mut networks = BTreeMap::new();
        networks.insert(
            format!("{pot}_net"),
            EndpointSettings {
                network_id: format!("net{pot}"),
                aliases: vec![name.to_string()],
                ipv4_address: Some(format!("172.30.{}.{}", slot / 200, 10 + slot % 200)),
                ipv6_address: None,
            },
        );
        let info = ContainerInfo {
            id: id.clone(),
            name: name.to_string(),
            image: format!("{pot}/{name}:latest"),
            labels,
            ports: vec![PortMapping {
                container_port: 2222,
                protocol: "tcp".to_string(),
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(22 + slot),
            }],
            networks,
            state: "running".to_string(),
        };
        self.state.lock().unwrap().containers.insert(id.clone(), info);
        id
    }

    /// Add a running container with no published ports or static address.
    pub fn add_unbound_container(&self, pot: &str, name: &str) -> String {
        let id = self.add_container(pot, name);
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.get_mut(&id) {
            c.ports.clear();
            for endpoint in c.networks.values_mut() {
                endpoint.ipv4_address = None;
            }
        }
        id
    }

    /// Network plus one container named after the pot's role.
    pub fn add_pot(&self, pot: &str, containers: &[&str]) {
        self.add_network(pot);
        for name in containers {
            self.add_container(pot, name);
        }
    }

    pub fn fail(&self, point: FailPoint) {
        self.state.lock().unwrap().failures.insert(point);
    }

    /// Fail every call as if the docker daemon were not running.
    pub fn stop_daemon(&self) {
        self.state.lock().unwrap().daemon_down = true;
    }

    pub fn heal(&self, point: FailPoint) {
        self.state.lock().unwrap().failures.remove(&point);
    }

    /// Make every commit wait for a permit on the returned semaphore.
    pub fn gate_commits(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.commit_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn containers_of(&self, pot: &str) -> Vec<ContainerInfo> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.pot_name(LABEL) == Some(pot))
            .cloned()
            .collect()
    }

    pub fn container(&self, id: &str) -> Option<ContainerInfo> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .count()
    }

    fn enter(&self, point: FailPoint, call: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.daemon_down {
            return Err(DockerError::NotRunning("Cannot connect to the Docker daemon".to_string()).into());
        }
        if state.failures.contains(&point) {
            return Err(fake_error(point));
        }
        Ok(())
    }

    fn require(&self, id: &str) -> Result<()> {
        if self.state.lock().unwrap().containers.contains_key(id) {
            Ok(())
        } else {
            Err(DockerError::NotFound(format!("No such container: {id}")).into())
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_pot_networks(&self) -> Result<Vec<PotNetwork>> {
        self.enter(FailPoint::ListNetworks, "list_networks".to_string())?;
        Ok(self.state.lock().unwrap().networks.clone())
    }

    async fn list_pot_containers(&self) -> Result<Vec<ContainerInfo>> {
        self.enter(FailPoint::ListContainers, "list_containers".to_string())?;
        Ok(self.state.lock().unwrap().containers.values().cloned().collect())
    }

    async fn write_logs(&self, container: &str, dest: &Path) -> Result<()> {
        self.enter(FailPoint::Logs, format!("logs {container}"))?;
        self.require(container)?;
        tokio::fs::write(dest, format!("2024-01-01T00:00:00Z login attempt on {container}\n")).await?;
        Ok(())
    }

    async fn diff(&self, container: &str) -> Result<Vec<FsChange>> {
        self.enter(FailPoint::Diff, format!("diff {container}"))?;
        self.require(container)?;
        Ok(vec![
            FsChange { kind: ChangeKind::Changed, path: "/etc".to_string() },
            FsChange { kind: ChangeKind::Added, path: "/etc/shadow-".to_string() },
            FsChange { kind: ChangeKind::Deleted, path: "/tmp/dropper".to_string() },
        ])
    }

    async fn top(&self, container: &str) -> Result<String> {
        self.enter(FailPoint::Top, format!("top {container}"))?;
        self.require(container)?;
        Ok("PID USER CMD\n1 cowrie twistd\n".to_string())
    }

    async fn commit(&self, container: &str) -> Result<String> {
        let gate = self.commit_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.enter(FailPoint::Commit, format!("commit {container}"))?;
        self.require(container)?;
        let image = self.fresh_id("sha256:");
        self.state.lock().unwrap().images.insert(image.clone());
        Ok(image)
    }

    async fn save_image(&self, image: &str, dest: &Path) -> Result<()> {
        self.enter(FailPoint::Save, format!("save {image}"))?;
        if !self.state.lock().unwrap().images.contains(image) {
            return Err(DockerError::NotFound(format!("No such image: {image}")).into());
        }
        let mut body = format!("image {image}\n").into_bytes();
        body.resize(8 * 1024, 0);
        tokio::fs::write(dest, body).await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.state.lock().unwrap().calls.push(format!("rmi {image}"));
        self.state.lock().unwrap().images.remove(image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.enter(FailPoint::Create, format!("create {}", spec.name))?;
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(DockerError::CommandFailed(format!("Conflict: name {} in use", spec.name)).into());
        }
        let id = self.fresh_id("clean");
        state.containers.insert(
            id.clone(),
            ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                labels: spec.labels.clone(),
                ports: spec.ports.clone(),
                networks: spec.networks.clone(),
                state: "created".to_string(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container: &str) -> Result<()> {
        self.enter(FailPoint::Start, format!("start {container}"))?;
        self.require(container)?;
        let mut state = self.state.lock().unwrap();
        if let Some(message) = address_conflict(&state.containers, container) {
            return Err(DockerError::CommandFailed(message).into());
        }
        if let Some(c) = state.containers.get_mut(container) {
            c.state = "running".to_string();
        }
        Ok(())
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        self.enter(FailPoint::Remove, format!("rm {container}"))?;
        self.require(container)?;
        self.state.lock().unwrap().containers.remove(container);
        Ok(())
    }

    async fn rename_container(&self, container: &str, new_name: &str) -> Result<()> {
        self.enter(FailPoint::Rename, format!("rename {container} {new_name}"))?;
        self.require(container)?;
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|c| c.name == new_name) {
            return Err(DockerError::CommandFailed(format!("Conflict: name {new_name} in use")).into());
        }
        if let Some(c) = state.containers.get_mut(container) {
            c.name = new_name.to_string();
        }
        Ok(())
    }
}

/// Docker's refusal when a running container already holds one of
/// `container`'s host ports or static addresses.
fn address_conflict(containers: &BTreeMap<String, ContainerInfo>, container: &str) -> Option<String> {
    let starting = containers.get(container)?;
    let running = containers
        .values()
        .filter(|c| c.id != starting.id && c.is_running());
    for other in running {
        for port in &starting.ports {
            let Some(host_port) = port.host_port else { continue };
            let taken = other.ports.iter().any(|p| {
                p.host_port == Some(host_port) && p.protocol == port.protocol && p.host_ip == port.host_ip
            });
            if taken {
                let ip = port.host_ip.as_deref().unwrap_or("0.0.0.0");
                return Some(format!(
                    "Error response from daemon: driver failed programming external connectivity on \
                     endpoint {}: Bind for {ip}:{host_port} failed: port is already allocated",
                    starting.name
                ));
            }
        }
        for (network, endpoint) in &starting.networks {
            let Some(ip) = &endpoint.ipv4_address else { continue };
            let taken = other
                .networks
                .get(network)
                .is_some_and(|e| e.ipv4_address.as_ref() == Some(ip));
            if taken {
                return Some("Error response from daemon: Address already in use".to_string());
            }
        }
    }
    None
}

#[derive(Default)]
struct CaptureState {
    opened: Vec<String>,
    live: HashMap<String, usize>,
    max_live: HashMap<String, usize>,
    missing: HashSet<String>,
    hang_on_close: bool,
}

/// [`CaptureBackend`] that yields a few canned packets per open, then idles.
#[derive(Default)]
pub struct FakeCapture {
    state: Arc<Mutex<CaptureState>>,
    packets_per_open: usize,
}

impl FakeCapture {
    pub fn new(packets_per_open: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::default(),
            packets_per_open,
        })
    }

    /// Fail opens on `interface` as if it did not exist.
    pub fn remove_interface(&self, interface: &str) {
        self.state.lock().unwrap().missing.insert(interface.to_string());
    }

    /// Make every stream opened from now on block forever in `close`.
    pub fn hang_on_close(&self) {
        self.state.lock().unwrap().hang_on_close = true;
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn live(&self, interface: &str) -> usize {
        self.state.lock().unwrap().live.get(interface).copied().unwrap_or(0)
    }

    /// Highest number of simultaneously open captures seen on `interface`
    pub fn max_live(&self, interface: &str) -> usize {
        self.state.lock().unwrap().max_live.get(interface).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn open(&self, interface: &str, _params: &CaptureParams) -> Result<Box<dyn PacketStream>> {
        let mut state = self.state.lock().unwrap();
        if state.missing.contains(interface) {
            return Err(CaptureError::InterfaceNotFound(interface.to_string()).into());
        }
        state.opened.push(interface.to_string());
        let live = state.live.entry(interface.to_string()).or_default();
        *live += 1;
        let now_live = *live;
        let max = state.max_live.entry(interface.to_string()).or_default();
        *max = (*max).max(now_live);
        Ok(Box::new(FakeStream {
            interface: interface.to_string(),
            remaining: self.packets_per_open,
            state: Arc::clone(&self.state),
            closed: false,
            hang_on_close: state.hang_on_close,
        }))
    }
}

struct FakeStream {
    interface: String,
    remaining: usize,
    state: Arc<Mutex<CaptureState>>,
    closed: bool,
    hang_on_close: bool,
}

#[async_trait]
impl PacketStream for FakeStream {
    fn link_type(&self) -> u32 {
        LINKTYPE_ETHERNET
    }

    async fn next_packet(&mut self) -> Result<Option<CapturedPacket>> {
        if self.remaining == 0 {
            std::future::pending::<()>().await;
        }
        self.remaining -= 1;
        Ok(Some(CapturedPacket {
            ts_sec: 1_700_000_000,
            ts_usec: 0,
            orig_len: 60,
            data: vec![0x45; 60],
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        if !self.closed {
            self.closed = true;
            if let Some(live) = self.state.lock().unwrap().live.get_mut(&self.interface) {
                *live -= 1;
            }
        }
        Ok(())
    }
}

/// Interface the watcher binds for a network created by [`FakeRuntime::add_network`].
pub fn interface_for(network_id: &str) -> String {
    format!("br-{}", &network_id[..12])
}

/// In-memory sink for formatted log lines
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Route this thread's tracing output into a buffer until the guard drops.
///
/// Only sees events from the current thread, so use it from
/// current-thread runtimes.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
