//! Packet capture: pcap codec, capture backends, and the per-pot supervisor.

pub mod pcap;
pub mod source;
pub mod supervisor;

pub use pcap::CapturedPacket;
pub use source::{CaptureBackend, CaptureParams, PacketStream, TcpdumpBackend};
pub use supervisor::{CaptureEnd, CaptureSummary, CaptureTarget, run_capture};
