//! Pot data model
//!
//! A pot is a named decoy workload: one or more containers carrying the pot
//! label, attached to a dedicated network carrying the same label. Pots are
//! created elsewhere; potkeeper only discovers them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;

/// Docker network option that pins the bridge interface name.
pub const BRIDGE_NAME_OPTION: &str = "com.docker.network.bridge.name";

/// Network attached to a pot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotNetwork {
    /// Full network id
    pub id: String,
    /// Network name
    pub name: String,
    /// Pot name read from the pot label
    pub pot: String,
    /// Network labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Driver options
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl PotNetwork {
    /// Host interface that carries this network's traffic.
    ///
    /// An explicit bridge name option wins; otherwise Docker names the bridge
    /// `br-` plus the first 12 characters of the network id.
    #[must_use]
    pub fn capture_interface(&self) -> String {
        if let Some(name) = self.options.get(BRIDGE_NAME_OPTION) {
            if !name.is_empty() {
                return name.clone();
            }
        }
        let short: String = self.id.chars().take(12).collect();
        format!("br-{short}")
    }
}

/// Published or exposed container port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    /// `tcp`, `udp` or `sctp`
    pub protocol: String,
    /// Host address the port is bound to, when published
    pub host_ip: Option<String>,
    /// Host port, when published
    pub host_port: Option<u16>,
}

impl PortMapping {
    /// `docker create -p` argument, or `None` for expose-only ports.
    #[must_use]
    pub fn publish_spec(&self) -> Option<String> {
        let host_port = self.host_port?;
        let ip = match self.host_ip.as_deref() {
            None | Some("" | "0.0.0.0" | "::") => String::new(),
            Some(ip) if ip.contains(':') => format!("[{ip}]:"),
            Some(ip) => format!("{ip}:"),
        };
        Some(format!(
            "{ip}{host_port}:{}/{}",
            self.container_port, self.protocol
        ))
    }

    /// `docker create --expose` argument
    #[must_use]
    pub fn expose_spec(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Per-network endpoint configuration of a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub network_id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Statically assigned IPv4 address, if any
    pub ipv4_address: Option<String>,
    /// Statically assigned IPv6 address, if any
    pub ipv6_address: Option<String>,
}

/// Container belonging to a pot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    /// Name without the leading slash
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// Network name to endpoint settings; ordered so the primary network is stable
    pub networks: BTreeMap<String, EndpointSettings>,
    /// `running`, `exited`, ...
    pub state: String,
}

impl ContainerInfo {
    /// Pot name carried by `label`, if present.
    #[must_use]
    pub fn pot_name(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(String::as_str)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Pot with its containers, as discovered at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pot {
    pub name: String,
    pub containers: Vec<ContainerInfo>,
}

/// Reject pot names that cannot be used as a single path component.
pub fn validate_pot_name(name: &str) -> Result<(), ArtifactError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidPotName(name.to_string()))
    }
}

/// Group labeled containers into pots, sorted by pot name.
///
/// Containers without the label or with an unusable pot name are skipped and
/// returned separately so callers can log them.
pub fn group_into_pots(
    containers: Vec<ContainerInfo>,
    label: &str,
) -> (Vec<Pot>, Vec<ContainerInfo>) {
    let mut grouped: BTreeMap<String, Vec<ContainerInfo>> = BTreeMap::new();
    let mut rejected = Vec::new();
    for container in containers {
        match container.pot_name(label).map(str::to_string) {
            Some(pot) if validate_pot_name(&pot).is_ok() => {
                grouped.entry(pot).or_default().push(container);
            }
            _ => rejected.push(container),
        }
    }
    let pots = grouped
        .into_iter()
        .map(|(name, mut containers)| {
            containers.sort_by(|a, b| a.name.cmp(&b.name));
            Pot { name, containers }
        })
        .collect();
    (pots, rejected)
}
