//! potkeeper-core: honeypot pot lifecycle and forensic capture orchestration
//!
//! A pot is a decoy workload: one or more labeled containers on a dedicated
//! network. This crate keeps a packet capture running for every live pot and,
//! on a fixed interval, rotates each pot: collect forensic artifacts, stop
//! capture, fingerprint and archive the evidence, swap the dirty containers
//! for clean clones, resume capture.
//!
//! # Architecture
//!
//! ```text
//! docker networks --> NetworkWatcher --> capture tasks --> <root>/<pot>/network_<ts>.pcap
//!                          ^  resume            | stop
//!                          |                SignalBus
//!                          |                    |
//! docker containers --> RotationScheduler --> rotate_pot
//!        collect -> stop capture -> hash.json -> <pot>_<ts>.tar.gz -> replace -> resume
//! ```
//!
//! # Modules
//!
//! - `signal`: per-pot stop slots and resume requests
//! - `capture`: pcap codec, tcpdump backend, per-pot capture task
//! - `watcher`: network discovery and resume dispatch
//! - `artifact`: per-container evidence extraction
//! - `manifest`: SHA-256 manifest (`hash.json`)
//! - `archive`: verified `tar.gz` bundles
//! - `replace`: clean container replacement
//! - `rotation` / `scheduler`: the rotation pipeline and its timer
//! - `journal`: durable rotation state and crash recovery
//! - `orchestrator`: owns the long-running tasks
//! - `docker`: container runtime trait and docker CLI adapter
//! - `config` / `logging` / `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod archive;
pub mod artifact;
pub mod capture;
pub mod config;
pub mod docker;
pub mod error;
pub mod journal;
pub mod layout;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod pot;
pub mod replace;
pub mod rotation;
pub mod scheduler;
pub mod signal;
pub mod status;
pub mod watcher;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorHandle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
