//! Rotation pipeline for one pot.
//!
//! ```text
//! Running(dirty) -> collecting -> capture_stopped -> hashed -> archived
//!                -> replaced -> capture_resumed -> Running(clean)
//! ```
//!
//! Steps run strictly in that order and each transition is journaled. A
//! failure abandons the pot's rotation for this cycle and leaves the dirty
//! containers running. Before capture was stopped the partial artifacts are
//! discarded; after it, the working directory is kept as `<pot>_<ts>_failed`
//! and capture is resumed. A capture that ignored its stop is aborted first;
//! if it still holds the working directory, the directory stays where it is.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::archive::archive_pot;
use crate::artifact::{collect_pot, discard_artifacts};
use crate::docker::ContainerRuntime;
use crate::error::{ArtifactError, Result};
use crate::journal::{RotationJournal, RotationRecord, RotationStage};
use crate::layout;
use crate::manifest::fingerprint;
use crate::pot::{Pot, validate_pot_name};
use crate::replace::{Replacement, replace_pot};
use crate::signal::{SignalBus, StopDelivery};

/// Everything a rotation needs, shared by all pipelines
pub struct RotationContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub bus: SignalBus,
    pub journal: RotationJournal,
    pub output_root: PathBuf,
    /// How long to wait for the capture to release its file
    pub stop_ack_timeout: Duration,
}

impl RotationContext {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        bus: SignalBus,
        output_root: impl Into<PathBuf>,
        stop_ack_timeout: Duration,
    ) -> Self {
        let output_root = output_root.into();
        Self {
            runtime,
            bus,
            journal: RotationJournal::new(&output_root),
            output_root,
            stop_ack_timeout,
        }
    }
}

/// A completed rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub pot: String,
    pub archive: PathBuf,
    pub manifest_entries: usize,
    pub replaced: Vec<Replacement>,
    pub elapsed: Duration,
}

/// Rotate one pot through the full pipeline.
pub async fn rotate_pot(ctx: &RotationContext, pot: &Pot) -> Result<RotationReport> {
    let started = Instant::now();
    let mut record = match begin_rotation(ctx, pot) {
        Ok(record) => record,
        Err(e) => {
            error!(pot = %pot.name, stage = "starting", error = %e, "rotation failed");
            return Err(e);
        }
    };
    let pot_dir = layout::pot_dir(&ctx.output_root, &pot.name);
    let mut capture_stopped = false;

    match run_steps(ctx, pot, &pot_dir, &mut record, &mut capture_stopped).await {
        Ok((archive, manifest_entries, replaced)) => {
            let elapsed = started.elapsed();
            info!(
                pot = %pot.name,
                archive = %archive.display(),
                files = manifest_entries,
                containers = replaced.len(),
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "rotation completed"
            );
            Ok(RotationReport {
                pot: pot.name.clone(),
                archive,
                manifest_entries,
                replaced,
                elapsed,
            })
        }
        Err(e) => {
            // `stage` is the last stage reached before the failure
            error!(pot = %pot.name, stage = %record.stage, error = %e, "rotation failed");
            handle_failure(ctx, &pot.name, &pot_dir, &mut record, capture_stopped, &e).await;
            Err(e)
        }
    }
}

fn begin_rotation(ctx: &RotationContext, pot: &Pot) -> Result<RotationRecord> {
    validate_pot_name(&pot.name)?;
    let containers = pot.containers.iter().map(|c| c.name.clone()).collect();
    ctx.journal.begin(&pot.name, containers)
}

async fn run_steps(
    ctx: &RotationContext,
    pot: &Pot,
    pot_dir: &Path,
    record: &mut RotationRecord,
    capture_stopped: &mut bool,
) -> Result<(PathBuf, usize, Vec<Replacement>)> {
    tokio::fs::create_dir_all(pot_dir).await?;
    collect_pot(ctx.runtime.as_ref(), pot, pot_dir).await?;

    let ticket = ctx.bus.send_stop(&pot.name);
    *capture_stopped = true;
    if ticket.delivery == StopDelivery::NoCapture {
        debug!(pot = %pot.name, "No live capture to stop");
    }
    if !ticket.wait_finished(ctx.stop_ack_timeout).await {
        return Err(ArtifactError::StopNotAcknowledged(pot.name.clone()).into());
    }
    ctx.journal.advance(record, RotationStage::CaptureStopped)?;

    let manifest = fingerprint(pot_dir).await?;
    let unix_secs = Utc::now().timestamp();
    let mut archive = layout::archive_path(&ctx.output_root, &pot.name, unix_secs);
    if archive.exists() {
        archive = layout::unique_path(
            &ctx.output_root,
            &format!("{}_{unix_secs}", pot.name),
            Some("tar.gz"),
        );
    }
    record.archive = Some(archive.clone());
    ctx.journal.advance(record, RotationStage::Hashed)?;

    let report = archive_pot(pot_dir, &pot.name, &archive, &manifest).await?;
    ctx.journal.advance(record, RotationStage::Archived)?;

    let replaced = replace_pot(ctx.runtime.as_ref(), pot, unix_secs).await?;
    ctx.journal.advance(record, RotationStage::Replaced)?;

    // The bundle is verified, so a leftover directory only costs disk space.
    if let Err(e) = tokio::fs::remove_dir_all(pot_dir).await {
        warn!(pot = %pot.name, dir = %pot_dir.display(), error = %e, "Failed to remove archived working directory");
    }

    ctx.bus.send_resume(&pot.name);
    ctx.journal.advance(record, RotationStage::CaptureResumed)?;
    ctx.journal.complete(record)?;

    Ok((report.path, manifest.len(), replaced))
}

async fn handle_failure(
    ctx: &RotationContext,
    pot: &str,
    pot_dir: &Path,
    record: &mut RotationRecord,
    capture_stopped: bool,
    cause: &crate::Error,
) {
    let mut preserved = None;
    if capture_stopped {
        let released = release_capture(ctx, pot).await;
        if !released {
            error!(
                pot = %pot,
                dir = %pot_dir.display(),
                "Capture still holds the working directory, leaving it in place"
            );
        } else if pot_dir.exists() {
            let dest = layout::failed_dir(&ctx.output_root, pot, Utc::now().timestamp());
            match tokio::fs::rename(pot_dir, &dest).await {
                Ok(()) => {
                    warn!(pot = %pot, dir = %dest.display(), "Evidence of failed rotation preserved");
                    preserved = Some(dest);
                }
                Err(e) => {
                    warn!(pot = %pot, error = %e, "Failed to move working directory aside");
                }
            }
        }
        if let Some(archive) = &record.archive {
            let partial = layout::partial_archive_path(archive);
            match tokio::fs::remove_file(&partial).await {
                Ok(()) => debug!(pot = %pot, path = %partial.display(), "Removed partial archive"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(pot = %pot, error = %e, "Failed to remove partial archive"),
            }
        }
        ctx.bus.send_resume(pot);
    } else if let Err(e) = discard_artifacts(pot_dir).await {
        warn!(pot = %pot, error = %e, "Failed to discard partial artifacts");
    }

    if let Err(e) = ctx.journal.fail(record, &cause.to_string(), preserved) {
        warn!(pot = %pot, error = %e, "Failed to journal rotation failure");
    }
}

/// Make sure no capture writes into the pot's directory any more.
///
/// Returns false if the capture survived an abort request.
async fn release_capture(ctx: &RotationContext, pot: &str) -> bool {
    if !ctx.bus.is_capturing(pot) {
        return true;
    }
    warn!(pot = %pot, "Capture ignored its stop, requesting abort");
    ctx.bus
        .request_abort(pot)
        .wait_finished(ctx.stop_ack_timeout)
        .await
}

