//! Container runtime collaborator.
//!
//! [`ContainerRuntime`] is the seam between the orchestrator and whatever
//! manages containers. [`DockerCli`] implements it by shelling out to the
//! `docker` binary and parsing its JSON output. Every spawned command is
//! `kill_on_drop`, so a cancelled rotation never leaves a stray `docker`
//! process behind.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::DockerConfig;
use crate::error::{DockerError, Result};
use crate::pot::{ContainerInfo, EndpointSettings, PortMapping, PotNetwork};

/// Kind of filesystem change reported by a container diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Changed,
    Added,
    Deleted,
}

impl ChangeKind {
    #[must_use]
    pub const fn marker(self) -> char {
        match self {
            Self::Changed => 'C',
            Self::Added => 'A',
            Self::Deleted => 'D',
        }
    }
}

/// One line of a container filesystem diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsChange {
    pub kind: ChangeKind,
    pub path: String,
}

/// Everything needed to create a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// Network name to endpoint settings; the first entry is used at create time
    pub networks: BTreeMap<String, EndpointSettings>,
}

/// Operations the orchestrator needs from the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Networks carrying the pot label
    async fn list_pot_networks(&self) -> Result<Vec<PotNetwork>>;

    /// Containers carrying the pot label, in any state
    async fn list_pot_containers(&self) -> Result<Vec<ContainerInfo>>;

    /// Write the combined stdout/stderr log stream of `container` to `dest`
    async fn write_logs(&self, container: &str, dest: &Path) -> Result<()>;

    async fn diff(&self, container: &str) -> Result<Vec<FsChange>>;

    /// Process table snapshot; only valid for running containers
    async fn top(&self, container: &str) -> Result<String>;

    /// Commit `container` to a new image, returning the image id
    async fn commit(&self, container: &str) -> Result<String>;

    /// Export `image` as a tar stream into `dest`
    async fn save_image(&self, image: &str, dest: &Path) -> Result<()>;

    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container: &str) -> Result<()>;

    /// Force-remove a container, running or not
    async fn remove_container(&self, container: &str) -> Result<()>;

    async fn rename_container(&self, container: &str, new_name: &str) -> Result<()>;
}

/// [`ContainerRuntime`] backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    label: String,
    timeout: Option<Duration>,
}

impl DockerCli {
    #[must_use]
    pub fn new(config: &DockerConfig, label: impl Into<String>) -> Self {
        Self {
            binary: config.binary.clone(),
            label: label.into(),
            timeout: config.command_timeout(),
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run a metadata command with the configured timeout and return stdout.
    async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = self.command(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| DockerError::Timeout(limit.as_secs()))?,
            None => cmd.output().await,
        }
        .map_err(|e| spawn_error(&e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)).into())
        }
    }

    /// Run `docker inspect`-style commands that may partially fail when an
    /// object disappears between listing and inspecting.
    async fn run_inspect(&self, args: Vec<String>) -> Result<String> {
        let mut cmd = self.command(&args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| DockerError::Timeout(limit.as_secs()))?,
            None => cmd.output().await,
        }
        .map_err(|e| spawn_error(&e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.trim_start().starts_with('[') {
            debug!(stderr = %stderr.trim(), "docker inspect partially failed");
            return Ok(stdout);
        }
        Err(classify_failure(&stderr).into())
    }

    /// Run a long streaming command without a timeout, stdout into `dest`.
    async fn run_to_file(&self, args: &[&str], dest: &Path, with_stderr: bool) -> Result<()> {
        let file = std::fs::File::create(dest)?;
        let stderr = if with_stderr {
            Stdio::from(file.try_clone()?)
        } else {
            Stdio::piped()
        };
        let output = self
            .command(args)
            .stdout(Stdio::from(file))
            .stderr(stderr)
            .output()
            .await
            .map_err(|e| spawn_error(&e))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(&stderr).into())
        }
    }

    fn label_filter(&self) -> String {
        format!("label={}", self.label)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_pot_networks(&self) -> Result<Vec<PotNetwork>> {
        let ids = self
            .run(["network", "ls", "-q", "--no-trunc", "--filter", &self.label_filter()])
            .await?;
        let ids: Vec<String> = ids.split_whitespace().map(str::to_string).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["network".to_string(), "inspect".to_string()];
        args.extend(ids);
        let raw = self.run_inspect(args).await?;
        parse_network_inspect(&raw, &self.label)
    }

    async fn list_pot_containers(&self) -> Result<Vec<ContainerInfo>> {
        let ids = self
            .run(["ps", "-a", "-q", "--no-trunc", "--filter", &self.label_filter()])
            .await?;
        let ids: Vec<String> = ids.split_whitespace().map(str::to_string).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["container".to_string(), "inspect".to_string()];
        args.extend(ids);
        let raw = self.run_inspect(args).await?;
        parse_container_inspect(&raw)
    }

    async fn write_logs(&self, container: &str, dest: &Path) -> Result<()> {
        self.run_to_file(&logs_args(container), dest, true).await
    }

    async fn diff(&self, container: &str) -> Result<Vec<FsChange>> {
        let raw = self.run(["diff", container]).await?;
        Ok(parse_diff(&raw))
    }

    async fn top(&self, container: &str) -> Result<String> {
        self.run(["top", container]).await
    }

    async fn commit(&self, container: &str) -> Result<String> {
        let raw = self.run(["commit", container]).await?;
        let image = raw.trim();
        if image.is_empty() {
            return Err(DockerError::ParseError("docker commit printed no image id".to_string()).into());
        }
        Ok(image.to_string())
    }

    async fn save_image(&self, image: &str, dest: &Path) -> Result<()> {
        self.run_to_file(&["save", image], dest, false).await
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.run(["rmi", "--force", image]).await.map(|_| ())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let raw = self.run(create_args(spec)).await?;
        let id = raw.trim().to_string();
        if id.is_empty() {
            return Err(DockerError::ParseError("docker create printed no container id".to_string()).into());
        }
        // Only one network can be given to `docker create`.
        for (network, endpoint) in spec.networks.iter().skip(1) {
            if let Err(e) = self.run(connect_args(network, endpoint, &id)).await {
                warn!(container = %id, network = %network, error = %e, "Failed to connect network");
                let _ = self.remove_container(&id).await;
                return Err(e);
            }
        }
        Ok(id)
    }

    async fn start_container(&self, container: &str) -> Result<()> {
        self.run(["start", container]).await.map(|_| ())
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        self.run(["rm", "--force", "--volumes", container])
            .await
            .map(|_| ())
    }

    async fn rename_container(&self, container: &str, new_name: &str) -> Result<()> {
        self.run(["rename", container, new_name]).await.map(|_| ())
    }
}

fn spawn_error(e: &std::io::Error) -> DockerError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DockerError::CliNotFound
    } else {
        DockerError::CommandFailed(e.to_string())
    }
}

fn classify_failure(stderr: &str) -> DockerError {
    let message = stderr.trim().to_string();
    if message.contains("Cannot connect to the Docker daemon")
        || message.contains("Is the docker daemon running")
        || message.contains("permission denied while trying to connect")
    {
        DockerError::NotRunning(message)
    } else if message.contains("No such") || message.contains("not found") {
        DockerError::NotFound(message)
    } else {
        DockerError::CommandFailed(message)
    }
}

/// Logs exactly as the container wrote them, stdout and stderr interleaved.
fn logs_args(container: &str) -> [&str; 2] {
    ["logs", container]
}

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    let mut labels: Vec<_> = spec.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for port in &spec.ports {
        match port.publish_spec() {
            Some(publish) => {
                args.push("--publish".to_string());
                args.push(publish);
            }
            None => {
                args.push("--expose".to_string());
                args.push(port.expose_spec());
            }
        }
    }
    if let Some((network, endpoint)) = spec.networks.iter().next() {
        args.push("--network".to_string());
        args.push(network.clone());
        for alias in &endpoint.aliases {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
        if let Some(ip) = &endpoint.ipv4_address {
            args.push("--ip".to_string());
            args.push(ip.clone());
        }
        if let Some(ip) = &endpoint.ipv6_address {
            args.push("--ip6".to_string());
            args.push(ip.clone());
        }
    }
    args.push(spec.image.clone());
    args
}

fn connect_args(network: &str, endpoint: &EndpointSettings, container: &str) -> Vec<String> {
    let mut args = vec!["network".to_string(), "connect".to_string()];
    for alias in &endpoint.aliases {
        args.push("--alias".to_string());
        args.push(alias.clone());
    }
    if let Some(ip) = &endpoint.ipv4_address {
        args.push("--ip".to_string());
        args.push(ip.clone());
    }
    if let Some(ip) = &endpoint.ipv6_address {
        args.push("--ip6".to_string());
        args.push(ip.clone());
    }
    args.push(network.to_string());
    args.push(container.to_string());
    args
}

fn parse_diff(raw: &str) -> Vec<FsChange> {
    raw.lines()
        .filter_map(|line| {
            let (marker, path) = line.split_once(' ')?;
            let kind = match marker {
                "C" => ChangeKind::Changed,
                "A" => ChangeKind::Added,
                "D" => ChangeKind::Deleted,
                _ => return None,
            };
            Some(FsChange {
                kind,
                path: path.to_string(),
            })
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInspect {
    id: String,
    name: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    options: Option<HashMap<String, String>>,
}

fn parse_network_inspect(raw: &str, label: &str) -> Result<Vec<PotNetwork>> {
    let parsed: Vec<NetworkInspect> =
        serde_json::from_str(raw).map_err(|e| DockerError::ParseError(e.to_string()))?;
    Ok(parsed
        .into_iter()
        .filter_map(|net| {
            let labels = net.labels.unwrap_or_default();
            let pot = labels.get(label)?.clone();
            Some(PotNetwork {
                id: net.id,
                name: net.name,
                pot,
                labels,
                options: net.options.unwrap_or_default(),
            })
        })
        .collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    name: String,
    config: InspectConfig,
    network_settings: InspectNetworkSettings,
    state: InspectState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectBinding>>>>,
    #[serde(default)]
    networks: Option<HashMap<String, InspectEndpoint>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEndpoint {
    #[serde(rename = "NetworkID", default)]
    network_id: String,
    #[serde(default)]
    aliases: Option<Vec<String>>,
    #[serde(rename = "IPAMConfig", default)]
    ipam_config: Option<InspectIpam>,
}

#[derive(Deserialize)]
struct InspectIpam {
    #[serde(rename = "IPv4Address", default)]
    ipv4: Option<String>,
    #[serde(rename = "IPv6Address", default)]
    ipv6: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

/// `"2222/tcp"` into (2222, "tcp")
fn parse_port_key(key: &str) -> Option<(u16, String)> {
    let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
    Some((port.parse().ok()?, proto.to_string()))
}

fn parse_container_inspect(raw: &str) -> Result<Vec<ContainerInfo>> {
    let parsed: Vec<ContainerInspect> =
        serde_json::from_str(raw).map_err(|e| DockerError::ParseError(e.to_string()))?;
    Ok(parsed.into_iter().map(into_container_info).collect())
}

fn into_container_info(c: ContainerInspect) -> ContainerInfo {
    let mut ports = Vec::new();
    let published = c.network_settings.ports.unwrap_or_default();
    for (key, bindings) in &published {
        let Some((container_port, protocol)) = parse_port_key(key) else {
            continue;
        };
        let bindings = bindings.as_deref().unwrap_or_default();
        if bindings.is_empty() {
            ports.push(PortMapping {
                container_port,
                protocol,
                host_ip: None,
                host_port: None,
            });
            continue;
        }
        for binding in bindings {
            ports.push(PortMapping {
                container_port,
                protocol: protocol.clone(),
                host_ip: (!binding.host_ip.is_empty()).then(|| binding.host_ip.clone()),
                host_port: binding.host_port.parse().ok(),
            });
        }
    }
    // Stopped containers report no bindings; fall back to the image's exposed ports.
    for key in c.config.exposed_ports.unwrap_or_default().keys() {
        if published.contains_key(key) {
            continue;
        }
        if let Some((container_port, protocol)) = parse_port_key(key) {
            ports.push(PortMapping {
                container_port,
                protocol,
                host_ip: None,
                host_port: None,
            });
        }
    }
    ports.sort_by(|a, b| {
        (a.container_port, &a.protocol, a.host_port).cmp(&(b.container_port, &b.protocol, b.host_port))
    });
    // IPv4 and IPv6 bindings of the same host port publish identically.
    ports.dedup_by(|a, b| a.publish_spec() == b.publish_spec() && a.expose_spec() == b.expose_spec());

    let networks = c
        .network_settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, ep)| {
            let aliases = ep
                .aliases
                .unwrap_or_default()
                .into_iter()
                .filter(|alias| !c.id.starts_with(alias.as_str()))
                .collect();
            let (ipv4, ipv6) = ep
                .ipam_config
                .map(|ipam| (ipam.ipv4, ipam.ipv6))
                .unwrap_or_default();
            (
                name,
                EndpointSettings {
                    network_id: ep.network_id,
                    aliases,
                    ipv4_address: ipv4.filter(|ip| !ip.is_empty()),
                    ipv6_address: ipv6.filter(|ip| !ip.is_empty()),
                },
            )
        })
        .collect();

    ContainerInfo {
        name: c.name.trim_start_matches('/').to_string(),
        id: c.id,
        image: c.config.image,
        labels: c.config.labels.unwrap_or_default(),
        ports,
        networks,
        state: c.state.status,
    }
}
