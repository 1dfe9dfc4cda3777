//! Rotation scheduler.
//!
//! Ticks on the rotation interval. The first tick after start only arms the
//! schedule; every later tick lists pots fresh from the runtime and spawns one
//! rotation pipeline per pot into a [`JoinSet`]. A pot whose previous
//! rotation is still running is skipped for that tick.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{ArtifactError, Result};
use crate::pot::group_into_pots;
use crate::rotation::{RotationContext, RotationReport, rotate_pot};

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub pot_label: String,
    /// How long in-flight rotations may run after shutdown before abort
    pub shutdown_grace: Duration,
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Removes its pot from the in-flight set when the pipeline task ends,
/// including by panic or abort.
struct InFlightGuard {
    pot: String,
    in_flight: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.pot);
    }
}

pub struct RotationScheduler {
    ctx: Arc<RotationContext>,
    config: SchedulerConfig,
    in_flight: InFlight,
    pipelines: JoinSet<(String, Result<RotationReport>)>,
}

impl RotationScheduler {
    #[must_use]
    pub fn new(ctx: Arc<RotationContext>, config: SchedulerConfig) -> Self {
        Self {
            ctx,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            pipelines: JoinSet::new(),
        }
    }

    /// Pots with a rotation currently running, sorted
    #[must_use]
    pub fn in_flight(&self) -> Vec<String> {
        let mut pots: Vec<String> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        pots.sort();
        pots
    }

    /// Run until `shutdown` flips to true, then drain or abort pipelines.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Rotation scheduler started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        debug!("Cold start, first rotation after one full interval");

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = self.pipelines.join_next(), if !self.pipelines.is_empty() => {
                    log_joined(joined);
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.drain().await;
        info!("Rotation scheduler stopped");
    }

    /// Launch a rotation for every pot not already rotating.
    ///
    /// Returns the pots that were launched.
    pub async fn tick(&mut self) -> Vec<String> {
        let containers = match self.ctx.runtime.list_pot_containers().await {
            Ok(containers) => containers,
            Err(e) if e.is_daemon_unavailable() => {
                error!(error = %e, "Docker unavailable, skipping rotation tick");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "Failed to list pot containers, skipping rotation tick");
                return Vec::new();
            }
        };
        let (pots, rejected) = group_into_pots(containers, &self.config.pot_label);
        for container in &rejected {
            let reason = match container.pot_name(&self.config.pot_label) {
                Some(name) => ArtifactError::InvalidPotName(name.to_string()),
                None => ArtifactError::MissingLabel {
                    container: container.name.clone(),
                },
            };
            warn!(container = %container.name, error = %reason, "Not rotating container");
        }

        let mut launched = Vec::new();
        for pot in pots {
            let newly_added = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(pot.name.clone());
            if !newly_added {
                warn!(pot = %pot.name, "Previous rotation still running, skipping");
                continue;
            }
            let guard = InFlightGuard {
                pot: pot.name.clone(),
                in_flight: Arc::clone(&self.in_flight),
            };
            let ctx = Arc::clone(&self.ctx);
            launched.push(pot.name.clone());
            let span = crate::pot_span!("rotation", pot = pot.name.as_str());
            self.pipelines.spawn(
                async move {
                    let _guard = guard;
                    let result = rotate_pot(&ctx, &pot).await;
                    (pot.name, result)
                }
                .instrument(span),
            );
        }
        if !launched.is_empty() {
            info!(pots = launched.len(), "Rotation tick");
        }
        launched
    }

    /// Wait for every in-flight pipeline to finish.
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.pipelines.join_next().await {
            log_joined(joined);
        }
    }

    async fn drain(&mut self) {
        if self.pipelines.is_empty() {
            return;
        }
        info!(
            pots = ?self.in_flight(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Waiting for in-flight rotations"
        );
        if tokio::time::timeout(self.config.shutdown_grace, self.wait_idle())
            .await
            .is_err()
        {
            warn!(pots = ?self.in_flight(), "Aborting in-flight rotations");
            self.pipelines.abort_all();
            while self.pipelines.join_next().await.is_some() {}
        }
    }
}

fn log_joined(joined: std::result::Result<(String, Result<RotationReport>), tokio::task::JoinError>) {
    match joined {
        // rotate_pot logs both outcomes itself
        Ok((pot, Ok(_))) => debug!(pot = %pot, "Rotation pipeline finished"),
        Ok((pot, Err(_))) => debug!(pot = %pot, "Rotation pipeline failed"),
        Err(e) if e.is_cancelled() => debug!("Rotation pipeline cancelled"),
        Err(e) => error!(error = %e, "Rotation pipeline panicked"),
    }
}
