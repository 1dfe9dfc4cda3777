//! potkeeper - honeypot pot rotation and traffic capture
//!
//! `potkeeper collect` runs the daemon: one packet capture per live pot
//! network, and every interval a rotation of each pot (collect forensic
//! artifacts, archive them, replace the containers with clean clones).
//! `potkeeper status` inspects an output root without touching it.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use potkeeper_core::config::{Config, LogFormat};
use potkeeper_core::error::format_error_with_remediation;
use potkeeper_core::logging::init_logging;
use potkeeper_core::status::{StatusReport, scan};
use potkeeper_core::Orchestrator;
use tracing::{info, warn};

/// potkeeper - rotate honeypot pots and keep their traffic
#[derive(Parser, Debug)]
#[command(name = "potkeeper")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "POTKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture pot traffic and rotate pots until interrupted
    Collect {
        /// Output root for captures, artifacts and archives
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Rotation interval in hours
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
    },

    /// Show pots being captured and rotations that need attention
    Status {
        /// Output root to inspect
        #[arg(short, long)]
        path: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .map_err(potkeeper_core::Error::from)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(file) = &cli.log_file {
        config.logging.file = Some(file.clone());
    }
    Ok(config)
}

async fn collect(mut config: Config, path: Option<PathBuf>, interval: Option<u64>) -> Result<()> {
    if let Some(path) = path {
        config.collector.output_root = Some(path);
    }
    if let Some(hours) = interval {
        config.collector.interval_hours = hours;
    }

    let orchestrator = Orchestrator::from_config(&config)?;
    let shutdown = ShutdownSignal::install()?;
    let handle = orchestrator.start().await?;
    for record in handle.recovered() {
        warn!(
            pot = %record.pot,
            stage = %record.stage,
            preserved = ?record.preserved_dir,
            "Previous run was interrupted mid-rotation"
        );
    }

    let signal = shutdown.recv().await?;
    info!(signal, "Shutting down");
    handle.shutdown().await?;
    Ok(())
}

/// Ctrl-C, or SIGTERM from a service manager on unix.
///
/// Installed before the daemon starts so an early SIGTERM still shuts down
/// cleanly.
struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    fn install() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("installing SIGTERM handler")?,
        })
    }

    /// Wait for the first shutdown signal and name it.
    #[cfg(unix)]
    async fn recv(mut self) -> Result<&'static str> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                Ok("SIGINT")
            }
            _ = self.terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    async fn recv(self) -> Result<&'static str> {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        Ok("Ctrl-C")
    }
}

fn status(path: &Path, json: bool) -> Result<()> {
    let report = scan(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_status(&report));
    }
    Ok(())
}

fn render_status(report: &StatusReport) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "Output root: {}", report.root.display());

    let _ = writeln!(out, "\nPots ({}):", report.working.len());
    for dir in &report.working {
        let _ = writeln!(
            out,
            "  {:<24} {} capture file(s), {} bytes",
            dir.pot, dir.capture_files, dir.size_bytes
        );
    }

    let _ = writeln!(out, "\nArchives: {}", report.archives.len());
    if let Some(latest) = report.archives.last() {
        let _ = writeln!(out, "  last: {}", latest.path.display());
    }

    for (title, records) in [
        ("Rotations in progress", &report.in_progress),
        ("Failed rotations", &report.failed),
        ("Interrupted rotations", &report.interrupted),
    ] {
        if records.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{title} ({}):", records.len());
        for record in records {
            let _ = write!(
                out,
                "  {:<24} stage={} updated={}",
                record.pot,
                record.stage,
                record.updated_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            );
            if let Some(dir) = &record.preserved_dir {
                let _ = write!(out, " evidence={}", dir.display());
            }
            if let Some(error) = &record.error {
                let _ = write!(out, " error={error}");
            }
            out.push('\n');
        }
    }
    out
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Collect { path, interval } => {
            init_logging(&config.logging).context("initializing logging")?;
            collect(config, path, interval).await
        }
        Commands::Status { path, json } => status(&path, json),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<potkeeper_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
