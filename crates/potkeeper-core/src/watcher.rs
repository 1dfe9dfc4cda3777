//! Network watcher: keeps one capture running per live pot network.
//!
//! Every discovery tick the watcher fetches the pot-labeled networks, diffs
//! them against its managed set, stops captures for networks that vanished
//! and starts captures for networks that appeared. It is also the resume
//! dispatcher: rotations ask for capture to restart through the signal bus,
//! and the watcher starts a fresh capture if the pot's network is still
//! managed. Captures that ignored their stop are aborted on request.
//!
//! The managed set and the capture task handles are owned by the watcher task
//! alone; the signal bus is the only state it shares.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureBackend, CaptureParams, CaptureTarget, run_capture};
use crate::docker::ContainerRuntime;
use crate::layout;
use crate::pot::{PotNetwork, validate_pot_name};
use crate::signal::SignalBus;

/// A pot network the watcher currently manages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedPotEntry {
    pub network_id: String,
    pub network_name: String,
    pub pot: String,
    pub interface: String,
    pub discovered_at: DateTime<Utc>,
}

/// Changes produced by one discovery tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDiff {
    pub added: Vec<ManagedPotEntry>,
    pub removed: Vec<ManagedPotEntry>,
}

impl NetworkDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Managed pot networks keyed by network id
#[derive(Debug, Default)]
pub struct ManagedPots {
    entries: BTreeMap<String, ManagedPotEntry>,
}

impl ManagedPots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile against the networks seen this tick.
    ///
    /// Afterwards the managed ids equal exactly the ids in `current`.
    pub fn discovery_tick(&mut self, current: &[PotNetwork], now: DateTime<Utc>) -> NetworkDiff {
        let current_ids: HashMap<&str, &PotNetwork> =
            current.iter().map(|net| (net.id.as_str(), net)).collect();

        let gone: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !current_ids.contains_key(id.as_str()))
            .cloned()
            .collect();
        let removed = gone
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect();

        let mut added = Vec::new();
        let mut fresh: Vec<&PotNetwork> = current_ids
            .values()
            .filter(|net| !self.entries.contains_key(&net.id))
            .copied()
            .collect();
        fresh.sort_by(|a, b| a.id.cmp(&b.id));
        for net in fresh {
            let entry = ManagedPotEntry {
                network_id: net.id.clone(),
                network_name: net.name.clone(),
                pot: net.pot.clone(),
                interface: net.capture_interface(),
                discovered_at: now,
            };
            self.entries.insert(net.id.clone(), entry.clone());
            added.push(entry);
        }

        NetworkDiff { added, removed }
    }

    /// Managed entry for `pot`, lowest network id first
    #[must_use]
    pub fn entry_for_pot(&self, pot: &str) -> Option<&ManagedPotEntry> {
        self.entries.values().find(|entry| entry.pot == pot)
    }

    #[must_use]
    pub fn contains_network(&self, network_id: &str) -> bool {
        self.entries.contains_key(network_id)
    }

    pub fn network_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct CaptureHandle {
    network_id: String,
    task: JoinHandle<()>,
}

/// Watcher settings
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub output_root: PathBuf,
    pub discovery_interval: Duration,
    pub capture: CaptureParams,
    /// How long to wait for a stopped capture to release its file
    pub stop_timeout: Duration,
}

/// Discovery loop and resume dispatcher
pub struct NetworkWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    backend: Arc<dyn CaptureBackend>,
    bus: SignalBus,
    config: WatcherConfig,
    managed: ManagedPots,
    captures: HashMap<String, CaptureHandle>,
}

impl NetworkWatcher {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        backend: Arc<dyn CaptureBackend>,
        bus: SignalBus,
        config: WatcherConfig,
    ) -> Self {
        Self {
            runtime,
            backend,
            bus,
            config,
            managed: ManagedPots::new(),
            captures: HashMap::new(),
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped), then
    /// stop every live capture and wait for them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.discovery_interval.as_secs(),
            root = %self.config.output_root.display(),
            "Network watcher started"
        );
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let bus = self.bus.clone();

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = bus.abort_requested() => self.dispatch_aborts().await,
                () = bus.resume_requested() => self.dispatch_resumes().await,
                _ = ticker.tick() => self.discovery_tick().await,
            }
        }

        self.stop_all().await;
        info!("Network watcher stopped");
    }

    async fn discovery_tick(&mut self) {
        self.reap_finished();
        let networks = match self.runtime.list_pot_networks().await {
            Ok(networks) => networks,
            Err(e) if e.is_daemon_unavailable() => {
                error!(error = %e, "Docker unavailable, cannot list pot networks");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to list pot networks");
                return;
            }
        };
        let diff = self.managed.discovery_tick(&networks, Utc::now());
        if diff.is_empty() {
            return;
        }
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            managed = self.managed.len(),
            "Pot networks changed"
        );

        for entry in &diff.removed {
            info!(pot = %entry.pot, network_id = %entry.network_id, "Pot network removed");
            let bound_here = self
                .captures
                .get(&entry.pot)
                .is_some_and(|handle| handle.network_id == entry.network_id);
            if bound_here {
                self.bus.send_stop(&entry.pot);
            }
        }
        for entry in &diff.added {
            info!(
                pot = %entry.pot,
                network_id = %entry.network_id,
                interface = %entry.interface,
                "Pot network discovered"
            );
            self.start_capture(entry).await;
        }
    }

    async fn dispatch_aborts(&mut self) {
        for pot in self.bus.take_aborts() {
            let Some(handle) = self.captures.remove(&pot) else {
                debug!(pot = %pot, "Abort for pot without a capture task ignored");
                continue;
            };
            warn!(pot = %pot, network_id = %handle.network_id, "Aborting capture that ignored its stop");
            handle.task.abort();
            let _ = handle.task.await;
        }
    }

    async fn dispatch_resumes(&mut self) {
        for pot in self.bus.take_resumes() {
            let Some(entry) = self.managed.entry_for_pot(&pot).cloned() else {
                info!(pot = %pot, "Resume for unmanaged pot ignored");
                continue;
            };
            if self.bus.is_capturing(&pot) {
                debug!(pot = %pot, "Resume ignored, capture already live");
                continue;
            }
            info!(pot = %pot, "Resuming capture");
            self.start_capture(&entry).await;
        }
    }

    async fn start_capture(&mut self, entry: &ManagedPotEntry) {
        if let Err(e) = validate_pot_name(&entry.pot) {
            warn!(pot = %entry.pot, network_id = %entry.network_id, error = %e, "Not capturing pot");
            return;
        }
        if let Some(previous) = self.captures.remove(&entry.pot) {
            if !previous.task.is_finished() {
                if previous.network_id != entry.network_id
                    && self.managed.contains_network(&previous.network_id)
                {
                    warn!(
                        pot = %entry.pot,
                        network_id = %entry.network_id,
                        capturing = %previous.network_id,
                        "Pot has more than one network; keeping existing capture"
                    );
                    self.captures.insert(entry.pot.clone(), previous);
                    return;
                }
                self.finish_capture(&entry.pot, previous).await;
            }
        }

        let stop = match self.bus.register_capture(&entry.pot) {
            Ok(stop) => stop,
            Err(e) => {
                warn!(pot = %entry.pot, error = %e, "Failed to start capture");
                return;
            }
        };
        let target = CaptureTarget {
            pot: entry.pot.clone(),
            interface: entry.interface.clone(),
            output_dir: layout::pot_dir(&self.config.output_root, &entry.pot),
        };
        let backend = Arc::clone(&self.backend);
        let params = self.config.capture.clone();
        let task = tokio::spawn(async move {
            // run_capture logs its own outcome
            let _ = run_capture(target, backend, params, stop).await;
        });
        self.captures.insert(
            entry.pot.clone(),
            CaptureHandle {
                network_id: entry.network_id.clone(),
                task,
            },
        );
    }

    /// Stop one capture and wait for it, aborting after the stop timeout.
    async fn finish_capture(&self, pot: &str, handle: CaptureHandle) {
        self.bus.send_stop(pot);
        let mut task = handle.task;
        if tokio::time::timeout(self.config.stop_timeout, &mut task)
            .await
            .is_err()
        {
            warn!(pot = %pot, "Capture did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }
    }

    fn reap_finished(&mut self) {
        self.captures.retain(|_, handle| !handle.task.is_finished());
    }

    async fn stop_all(&mut self) {
        let captures: Vec<(String, CaptureHandle)> = self.captures.drain().collect();
        if captures.is_empty() {
            return;
        }
        info!(count = captures.len(), "Stopping captures");
        let this = &*self;
        let stops = captures
            .into_iter()
            .map(|(pot, handle)| async move { this.finish_capture(&pot, handle).await });
        futures::future::join_all(stops).await;
    }
}
