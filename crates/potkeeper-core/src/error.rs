//! Error types for potkeeper-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
    /// Optional platform hint (e.g., "macOS", "Linux")
    pub platform: Option<String>,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
    /// Optional reference for more details
    pub learn_more: Option<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
            learn_more: None,
        }
    }

    /// Add a command without a platform hint
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
            platform: None,
        });
        self
    }

    /// Add a command with a platform hint
    #[must_use]
    pub fn platform_command(
        mut self,
        label: impl Into<String>,
        command: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
            platform: Some(platform.into()),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Add a learn-more reference
    #[must_use]
    pub fn learn_more(mut self, link: impl Into<String>) -> Self {
        self.learn_more = Some(link.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let label = cmd.platform.as_ref().map_or_else(
                    || cmd.label.clone(),
                    |platform| format!("{} ({platform})", cmd.label),
                );
                let _ = writeln!(output, "    - {label}: {}", cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        if let Some(learn_more) = &self.learn_more {
            let _ = writeln!(output, "  Learn more: {learn_more}");
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for potkeeper-core
#[derive(Error, Debug)]
pub enum Error {
    /// Container runtime (docker CLI) errors
    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    /// Packet capture errors
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Artifact collection, fingerprinting and archiving errors
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, closed channels, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// See [`DockerError::is_daemon_unavailable`].
    #[must_use]
    pub fn is_daemon_unavailable(&self) -> bool {
        matches!(self, Self::Docker(err) if err.is_daemon_unavailable())
    }

    /// See [`DockerError::is_address_conflict`].
    #[must_use]
    pub fn is_address_conflict(&self) -> bool {
        matches!(self, Self::Docker(err) if err.is_address_conflict())
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Docker(err) => Some(err.remediation()),
            Self::Capture(err) => Some(err.remediation()),
            Self::Artifact(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and free space, then retry.")
                    .command("Check free space", "df -h")
                    .alternative("Verify the output directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for truncated files left by an interrupted run."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the collector and retry.")
                    .command("Status", "potkeeper status --path <output-root>")
                    .alternative("If the issue persists, run with --log-level debug."),
            ),
        }
    }
}

/// Container runtime errors
#[derive(Error, Debug)]
pub enum DockerError {
    /// docker binary not found in PATH
    #[error("docker CLI not found in PATH. Install Docker or set docker.binary.")]
    CliNotFound,

    /// docker daemon is not reachable
    #[error("Docker daemon is not running or not reachable: {0}")]
    NotRunning(String),

    /// Referenced container, image or network does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Command execution failed with stderr output
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// JSON parsing failed
    #[error("Failed to parse docker output: {0}")]
    ParseError(String),

    /// Timeout waiting for command
    #[error("Command timed out after {0} seconds")]
    Timeout(u64),
}

impl DockerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::CliNotFound => Remediation::new(
                "Install Docker and ensure `docker` is on PATH (or set docker.binary).",
            )
            .platform_command("Install", "sudo apt install docker.io", "Linux (Debian/Ubuntu)")
            .platform_command("Install", "sudo pacman -S docker", "Linux (Arch)")
            .command("Verify install", "docker version")
            .learn_more("https://docs.docker.com/engine/install/"),
            Self::NotRunning(_) => Remediation::new("Start the Docker daemon and retry.")
                .platform_command("Start daemon", "sudo systemctl start docker", "Linux")
                .command("Check daemon", "docker info")
                .alternative("Ensure the current user can access the Docker socket."),
            Self::NotFound(_) => Remediation::new(
                "The referenced object disappeared. It was likely removed outside potkeeper.",
            )
            .command("List pots", "docker ps -a --filter label=pot.name")
            .alternative("The next rotation cycle will pick up the current state."),
            Self::CommandFailed(_) => {
                Remediation::new("docker command failed. Check the daemon logs and retry.")
                    .command("Check daemon", "docker info")
                    .platform_command("Daemon logs", "journalctl -u docker", "Linux")
            }
            Self::ParseError(_) => {
                Remediation::new("docker returned unexpected output; verify the version.")
                    .command("Check version", "docker version")
                    .alternative("Upgrade Docker if the output format changed.")
            }
            Self::Timeout(timeout) => Remediation::new(format!(
                "docker command timed out after {timeout} seconds. Try again when the host is idle."
            ))
            .command("Check daemon", "docker info")
            .alternative("Raise docker.command_timeout_secs in potkeeper.toml."),
        }
    }

    /// Returns true if the daemon itself is unusable (as opposed to one object).
    #[must_use]
    pub fn is_daemon_unavailable(&self) -> bool {
        matches!(
            self,
            Self::CliNotFound | Self::NotRunning(_) | Self::Timeout(_)
        )
    }

    /// Returns true if a start was refused because a host port or static
    /// address is still held by another container.
    #[must_use]
    pub fn is_address_conflict(&self) -> bool {
        let Self::CommandFailed(message) = self else {
            return false;
        };
        let message = message.to_ascii_lowercase();
        message.contains("port is already allocated") || message.contains("address already in use")
    }
}

/// Packet capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture backend binary missing
    #[error("Capture backend not found: {0}")]
    BackendNotFound(String),

    /// Capture interface does not exist on this host
    #[error("Capture interface not found: {0}")]
    InterfaceNotFound(String),

    /// Capture backend exited or refused to start
    #[error("Capture backend failed: {0}")]
    BackendFailed(String),

    /// Capture stream is not valid pcap
    #[error("Malformed capture stream: {0}")]
    MalformedStream(String),

    /// A capture for this pot is already live
    #[error("Capture already running for pot {0}")]
    AlreadyRunning(String),
}

impl CaptureError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::BackendNotFound(_) => Remediation::new(
                "Install tcpdump and ensure it is on PATH (or set capture.tcpdump_path).",
            )
            .platform_command("Install", "sudo apt install tcpdump", "Linux (Debian/Ubuntu)")
            .command("Verify install", "tcpdump --version"),
            Self::InterfaceNotFound(iface) => Remediation::new(format!(
                "Interface {iface} does not exist. Check the pot network's bridge name."
            ))
            .command("List interfaces", "ip link show")
            .alternative("Set com.docker.network.bridge.name on the pot network."),
            Self::BackendFailed(_) => Remediation::new(
                "Capture backend failed. Capturing usually requires CAP_NET_RAW.",
            )
            .command(
                "Grant capabilities",
                "sudo setcap cap_net_raw,cap_net_admin=eip $(command -v tcpdump)",
            )
            .alternative("Run potkeeper as root."),
            Self::MalformedStream(_) => {
                Remediation::new("Capture backend produced unreadable output.")
                    .command("Check version", "tcpdump --version")
                    .alternative("Restart capture by restarting the collector.")
            }
            Self::AlreadyRunning(_) => Remediation::new(
                "A capture for this pot is still shutting down. It will be restarted.",
            )
            .command("Status", "potkeeper status --path <output-root>"),
        }
    }
}

/// Artifact collection, fingerprinting and archiving errors
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Invalid pot name: {0:?}")]
    InvalidPotName(String),

    #[error("Container {container} has no pot label")]
    MissingLabel { container: String },

    #[error("Archive entry {path} does not match manifest hash")]
    HashMismatch { path: String },

    #[error("Manifest entry {0} is missing from archive")]
    MissingFromArchive(String),

    #[error("Archive contains unexpected entry {0}")]
    UnexpectedEntry(String),

    #[error("Capture for pot {0} did not acknowledge stop")]
    StopNotAcknowledged(String),
}

impl ArtifactError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::InvalidPotName(_) => Remediation::new(
                "Pot names are used as directory names. Use letters, digits, '-', '_' or '.'.",
            )
            .command("List pots", "docker ps -a --filter label=pot.name")
            .alternative("Redeploy the pot with a filesystem-safe name."),
            Self::MissingLabel { .. } => {
                Remediation::new("Only containers labeled pot.name are rotated.")
                    .command("Inspect labels", "docker inspect --format '{{json .Config.Labels}}' <container>")
            }
            Self::HashMismatch { .. } | Self::MissingFromArchive(_) | Self::UnexpectedEntry(_) => {
                Remediation::new(
                    "Archive verification failed. The working directory was preserved as *_failed.",
                )
                .command("Check free space", "df -h")
                .alternative("Inspect the preserved directory and re-archive it manually.")
            }
            Self::StopNotAcknowledged(_) => Remediation::new(
                "Capture did not stop in time; the capture file may be incomplete.",
            )
            .command("Status", "potkeeper status --path <output-root>")
            .alternative("Check that tcpdump is not blocked."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show config", "cat potkeeper.toml")
                .alternative("Validate the TOML syntax."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show config", "cat potkeeper.toml")
                    .alternative("Remove the field to fall back to its default.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
