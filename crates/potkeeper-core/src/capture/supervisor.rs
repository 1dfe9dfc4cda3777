//! Per-pot capture task.
//!
//! Persists one pot's traffic to `network_<ts>.pcap` in its working
//! directory until a stop addressed to that pot arrives. The file is flushed
//! and synced before the task returns, and the task's [`StopReceiver`] is
//! dropped last, so anyone waiting on a stop ticket sees a finalized file.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::pcap::{CapturedPacket, global_header, record_header};
use super::source::{CaptureBackend, CaptureParams, PacketStream};
use crate::error::Result;
use crate::layout;
use crate::signal::StopReceiver;

/// What to capture and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub pot: String,
    pub interface: String,
    /// Pot working directory
    pub output_dir: PathBuf,
}

/// Why a capture ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    /// A stop signal for this pot arrived
    Stopped,
    /// The capture source ended on its own (interface removed, backend exit)
    SourceEnded,
}

/// Result of one capture run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    /// `None` when stopped before the source opened
    pub path: Option<PathBuf>,
    pub packets: u64,
    pub bytes: u64,
    pub end: CaptureEnd,
}

/// Run one capture until stopped.
///
/// Any open, read or write failure ends this capture only and is returned to
/// the caller for logging.
pub async fn run_capture(
    target: CaptureTarget,
    backend: Arc<dyn CaptureBackend>,
    params: CaptureParams,
    mut stop: StopReceiver,
) -> Result<CaptureSummary> {
    let mut stream = tokio::select! {
        biased;
        () = stop.stopped() => {
            debug!(pot = %target.pot, "capture stopped before source opened");
            return Ok(CaptureSummary { path: None, packets: 0, bytes: 0, end: CaptureEnd::Stopped });
        }
        opened = backend.open(&target.interface, &params) => opened?,
    };

    let result = write_capture(&target, stream.as_mut(), &params, &mut stop).await;
    if let Err(e) = stream.close().await {
        warn!(pot = %target.pot, error = %e, "Failed to close capture source");
    }
    drop(stop);

    match &result {
        Ok(summary) => info!(
            pot = %target.pot,
            interface = %target.interface,
            path = ?summary.path,
            packets = summary.packets,
            bytes = summary.bytes,
            end = ?summary.end,
            "capture finished"
        ),
        Err(e) => warn!(
            pot = %target.pot,
            interface = %target.interface,
            error = %e,
            "capture failed"
        ),
    }
    result
}

async fn write_capture(
    target: &CaptureTarget,
    stream: &mut dyn PacketStream,
    params: &CaptureParams,
    stop: &mut StopReceiver,
) -> Result<CaptureSummary> {
    tokio::fs::create_dir_all(&target.output_dir).await?;
    let path = layout::capture_file_path(&target.output_dir, chrono::Utc::now().timestamp());
    let file = File::options()
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&global_header(params.snap_len, stream.link_type()))
        .await?;
    writer.flush().await?;

    info!(
        pot = %target.pot,
        interface = %target.interface,
        path = %path.display(),
        "capture started"
    );

    let mut packets = 0u64;
    let mut bytes = 0u64;
    let mut dirty = false;

    let end = loop {
        tokio::select! {
            biased;
            () = stop.stopped() => break CaptureEnd::Stopped,
            next = stream.next_packet() => match next? {
                Some(packet) => {
                    bytes += write_record(&mut writer, &packet, params.snap_len).await?;
                    packets += 1;
                    dirty = true;
                }
                None => break CaptureEnd::SourceEnded,
            },
            () = tokio::time::sleep(params.read_timeout), if dirty => {
                writer.flush().await?;
                dirty = false;
            }
        }
    };

    writer.flush().await?;
    let file = writer.into_inner();
    file.sync_all().await?;
    drop(file);

    Ok(CaptureSummary {
        path: Some(path),
        packets,
        bytes,
        end,
    })
}

async fn write_record(
    writer: &mut BufWriter<File>,
    packet: &CapturedPacket,
    snap_len: u32,
) -> Result<u64> {
    let header = record_header(packet, snap_len);
    let incl = packet.data.len().min(snap_len as usize);
    writer.write_all(&header).await?;
    writer.write_all(&packet.data[..incl]).await?;
    Ok((header.len() + incl) as u64)
}
