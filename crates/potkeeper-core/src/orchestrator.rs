//! Orchestrator: owns the watcher and scheduler tasks for the process lifetime.
//!
//! ```text
//!                      SignalBus (stop / resume)
//!                     /                        \
//!   NetworkWatcher --+-- capture tasks           RotationScheduler -- rotation pipelines
//! ```
//!
//! [`Orchestrator::start`] recovers interrupted rotations, spawns both loops
//! and returns a handle; [`OrchestratorHandle::shutdown`] stops every capture
//! and drains (or aborts) in-flight rotations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::capture::{CaptureBackend, CaptureParams, TcpdumpBackend};
use crate::config::Config;
use crate::docker::{ContainerRuntime, DockerCli};
use crate::error::{Error, Result};
use crate::journal::{RotationJournal, RotationRecord};
use crate::rotation::RotationContext;
use crate::scheduler::{RotationScheduler, SchedulerConfig};
use crate::signal::SignalBus;
use crate::watcher::{NetworkWatcher, WatcherConfig};

/// Assembled daemon, not yet running
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    backend: Arc<dyn CaptureBackend>,
    bus: SignalBus,
    output_root: PathBuf,
    watcher: WatcherConfig,
    scheduler: SchedulerConfig,
    stop_ack_timeout: Duration,
}

impl Orchestrator {
    /// Build from configuration with the docker and tcpdump adapters.
    pub fn from_config(config: &Config) -> Result<Self> {
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerCli::new(&config.docker, config.collector.pot_label.clone()));
        let backend: Arc<dyn CaptureBackend> = Arc::new(TcpdumpBackend::new(&config.capture));
        Self::with_collaborators(config, runtime, backend)
    }

    /// Build with explicit collaborators.
    pub fn with_collaborators(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let output_root = config.output_root()?.to_path_buf();
        let stop_ack_timeout = Duration::from_secs(config.collector.stop_ack_timeout_secs);
        Ok(Self {
            runtime,
            backend,
            bus: SignalBus::new(),
            watcher: WatcherConfig {
                output_root: output_root.clone(),
                discovery_interval: config.collector.discovery_interval(),
                capture: CaptureParams::from(&config.capture),
                stop_timeout: stop_ack_timeout,
            },
            scheduler: SchedulerConfig {
                interval: config.collector.rotation_interval(),
                pot_label: config.collector.pot_label.clone(),
                shutdown_grace: Duration::from_secs(config.collector.shutdown_grace_secs),
            },
            output_root,
            stop_ack_timeout,
        })
    }

    /// Override the rotation interval, which the config file only takes in hours.
    #[must_use]
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.scheduler.interval = interval;
        self
    }

    #[must_use]
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.watcher.discovery_interval = interval;
        self
    }

    /// The bus shared by the watcher and rotations
    #[must_use]
    pub fn bus(&self) -> SignalBus {
        self.bus.clone()
    }

    /// Recover interrupted rotations and spawn the watcher and scheduler.
    pub async fn start(self) -> Result<OrchestratorHandle> {
        if self.scheduler.interval.is_zero() || self.watcher.discovery_interval.is_zero() {
            return Err(Error::Runtime("intervals must be non-zero".to_string()));
        }
        tokio::fs::create_dir_all(&self.output_root).await?;
        let root = self.output_root.clone();
        let recovered = tokio::task::spawn_blocking(move || RotationJournal::new(root).recover_interrupted())
            .await
            .map_err(|e| Error::Runtime(format!("journal recovery task failed: {e}")))??;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = NetworkWatcher::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.backend),
            self.bus.clone(),
            self.watcher.clone(),
        );
        let watcher = tokio::spawn(watcher.run(shutdown_rx.clone()));

        let ctx = Arc::new(RotationContext::new(
            Arc::clone(&self.runtime),
            self.bus.clone(),
            &self.output_root,
            self.stop_ack_timeout,
        ));
        let scheduler = RotationScheduler::new(ctx, self.scheduler.clone());
        let scheduler = tokio::spawn(scheduler.run(shutdown_rx));

        info!(
            root = %self.output_root.display(),
            interval_secs = self.scheduler.interval.as_secs(),
            recovered = recovered.len(),
            "Orchestrator started"
        );
        Ok(OrchestratorHandle {
            shutdown_tx,
            watcher,
            scheduler,
            recovered,
            bus: self.bus,
        })
    }
}

/// Running daemon
pub struct OrchestratorHandle {
    shutdown_tx: watch::Sender<bool>,
    watcher: JoinHandle<()>,
    scheduler: JoinHandle<()>,
    recovered: Vec<RotationRecord>,
    bus: SignalBus,
}

impl OrchestratorHandle {
    /// Rotations found interrupted at startup
    #[must_use]
    pub fn recovered(&self) -> &[RotationRecord] {
        &self.recovered
    }

    #[must_use]
    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    /// Whether either loop has exited on its own
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.watcher.is_finished() || self.scheduler.is_finished()
    }

    /// Stop both loops and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("Orchestrator shutting down");
        let _ = self.shutdown_tx.send(true);
        let (watcher, scheduler) = tokio::join!(self.watcher, self.scheduler);
        for (task, joined) in [("watcher", watcher), ("scheduler", scheduler)] {
            if let Err(e) = joined {
                warn!(task, error = %e, "Task ended abnormally");
                return Err(Error::Runtime(format!("{task} task failed: {e}")));
            }
        }
        info!("Orchestrator stopped");
        Ok(())
    }
}
