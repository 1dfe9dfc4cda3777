//! Packet capture collaborator.
//!
//! A [`CaptureBackend`] opens live captures on host interfaces. The shipped
//! backend runs `tcpdump` writing pcap to stdout and decodes that stream on a
//! reader task, which keeps [`PacketStream::next_packet`] cancel-safe.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::pcap::{CapturedPacket, PcapReader};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};

/// Parameters for opening a live capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureParams {
    pub snap_len: u32,
    pub promiscuous: bool,
    /// Idle period after which the writer flushes
    pub read_timeout: Duration,
}

impl From<&CaptureConfig> for CaptureParams {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            snap_len: config.snap_len,
            promiscuous: config.promiscuous,
            read_timeout: config.read_timeout(),
        }
    }
}

/// Opens captures on named interfaces.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(&self, interface: &str, params: &CaptureParams) -> Result<Box<dyn PacketStream>>;
}

/// A live capture.
#[async_trait]
pub trait PacketStream: Send {
    /// Link-layer type written into the capture file header
    fn link_type(&self) -> u32;

    /// Next packet, `Ok(None)` once the capture has ended.
    ///
    /// Must be cancel-safe: callers race it against stop signals.
    async fn next_packet(&mut self) -> Result<Option<CapturedPacket>>;

    /// Release the capture handle
    async fn close(&mut self) -> Result<()>;
}

/// [`CaptureBackend`] that spawns tcpdump
#[derive(Debug, Clone)]
pub struct TcpdumpBackend {
    binary: String,
}

impl TcpdumpBackend {
    #[must_use]
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            binary: config.tcpdump_path.clone(),
        }
    }

    fn args(interface: &str, params: &CaptureParams) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            interface.to_string(),
            "-s".to_string(),
            params.snap_len.to_string(),
            "-U".to_string(),
            "-n".to_string(),
            "-w".to_string(),
            "-".to_string(),
        ];
        if !params.promiscuous {
            args.push("-p".to_string());
        }
        args
    }
}

#[async_trait]
impl CaptureBackend for TcpdumpBackend {
    async fn open(&self, interface: &str, params: &CaptureParams) -> Result<Box<dyn PacketStream>> {
        let mut child = Command::new(&self.binary)
            .args(Self::args(interface, params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CaptureError::BackendNotFound(self.binary.clone())
                } else {
                    CaptureError::BackendFailed(e.to_string())
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::BackendFailed("tcpdump stdout unavailable".to_string()))?;

        let reader = match PcapReader::open(stdout).await {
            Ok(reader) => reader,
            Err(header_err) => {
                // tcpdump exits before writing a header when it cannot open the interface.
                let stderr = drain_stderr(&mut child).await;
                let _ = child.wait().await;
                return Err(classify_tcpdump_failure(interface, &stderr, header_err).into());
            }
        };
        let link_type = reader.header().link_type;
        debug!(interface, link_type, "capture opened");

        let (tx, rx) = mpsc::channel(256);
        let reader_task = tokio::spawn(pump_packets(reader, tx));

        Ok(Box::new(TcpdumpStream {
            child,
            rx,
            reader_task,
            link_type,
        }))
    }
}

async fn pump_packets<R>(mut reader: PcapReader<R>, tx: mpsc::Sender<Result<CapturedPacket>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match reader.next_packet().await {
            Ok(Some(packet)) => {
                if tx.send(Ok(packet)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }
    }
}

async fn drain_stderr(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut text).await;
    }
    text
}

fn classify_tcpdump_failure(interface: &str, stderr: &str, fallback: CaptureError) -> CaptureError {
    let stderr = stderr.trim();
    if stderr.contains("No such device") || stderr.contains("doesn't exist") {
        CaptureError::InterfaceNotFound(interface.to_string())
    } else if stderr.is_empty() {
        fallback
    } else {
        CaptureError::BackendFailed(stderr.to_string())
    }
}

struct TcpdumpStream {
    child: Child,
    rx: mpsc::Receiver<Result<CapturedPacket>>,
    reader_task: JoinHandle<()>,
    link_type: u32,
}

#[async_trait]
impl PacketStream for TcpdumpStream {
    fn link_type(&self) -> u32 {
        self.link_type
    }

    async fn next_packet(&mut self) -> Result<Option<CapturedPacket>> {
        match self.rx.recv().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.reader_task.abort();
        if self.child.id().is_some() {
            let _ = self.child.start_kill();
        }
        self.child.wait().await?;
        Ok(())
    }
}
