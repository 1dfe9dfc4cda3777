//! Artifact collector: forensic evidence extraction per container.
//!
//! For each container the collector writes its combined log stream, its
//! filesystem diff, a process snapshot when the container is running, and a
//! full image export (commit, then save). Containers of one pot are collected
//! concurrently.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::docker::{ContainerRuntime, FsChange};
use crate::error::Result;
use crate::layout;
use crate::pot::{ContainerInfo, Pot, validate_pot_name};

/// Files collected for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedArtifacts {
    pub container: String,
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub diff_entries: usize,
}

/// Directory that holds a container's artifacts inside the pot directory.
///
/// Single-container pots use the pot directory itself.
#[must_use]
pub fn container_dir(pot_dir: &Path, pot: &Pot, container: &ContainerInfo) -> PathBuf {
    if pot.containers.len() <= 1 {
        return pot_dir.to_path_buf();
    }
    if validate_pot_name(&container.name).is_ok() {
        pot_dir.join(&container.name)
    } else {
        let short: String = container.id.chars().take(12).collect();
        pot_dir.join(short)
    }
}

/// Collect every container of `pot` into `pot_dir`.
///
/// All containers are collected even if one fails, so temporary images are
/// always cleaned up; the first error is returned.
pub async fn collect_pot(
    runtime: &dyn ContainerRuntime,
    pot: &Pot,
    pot_dir: &Path,
) -> Result<Vec<CollectedArtifacts>> {
    let jobs = pot.containers.iter().map(|container| {
        let dir = container_dir(pot_dir, pot, container);
        async move { collect_container(runtime, container, &dir).await }
    });
    let results = futures::future::join_all(jobs).await;

    let mut collected = Vec::with_capacity(results.len());
    for result in results {
        collected.push(result?);
    }
    Ok(collected)
}

/// Collect one container's artifacts into `dir`.
pub async fn collect_container(
    runtime: &dyn ContainerRuntime,
    container: &ContainerInfo,
    dir: &Path,
) -> Result<CollectedArtifacts> {
    tokio::fs::create_dir_all(dir).await?;
    let mut files = Vec::new();

    let log_path = dir.join(layout::LOG_FILE);
    runtime.write_logs(&container.id, &log_path).await?;
    files.push(log_path);

    let changes = runtime.diff(&container.id).await?;
    let diff_path = dir.join(layout::DIFF_FILE);
    write_diff(&diff_path, &changes).await?;
    files.push(diff_path);

    if container.is_running() {
        match runtime.top(&container.id).await {
            Ok(table) => {
                let top_path = dir.join(layout::TOP_FILE);
                tokio::fs::write(&top_path, table).await?;
                files.push(top_path);
            }
            Err(e) => {
                warn!(container = %container.name, error = %e, "Process snapshot skipped");
            }
        }
    } else {
        debug!(container = %container.name, state = %container.state, "Not running, no process snapshot");
    }

    let dump_path = dir.join(layout::DUMP_FILE);
    let image = runtime.commit(&container.id).await?;
    let saved = runtime.save_image(&image, &dump_path).await;
    if let Err(e) = runtime.remove_image(&image).await {
        warn!(container = %container.name, image = %image, error = %e, "Failed to remove forensic image");
    }
    saved?;
    files.push(dump_path);

    info!(
        container = %container.name,
        dir = %dir.display(),
        diff_entries = changes.len(),
        "Artifacts collected"
    );

    Ok(CollectedArtifacts {
        container: container.name.clone(),
        dir: dir.to_path_buf(),
        files,
        diff_entries: changes.len(),
    })
}

async fn write_diff(path: &Path, changes: &[FsChange]) -> Result<()> {
    let mut out = String::new();
    for change in changes {
        out.push(change.kind.marker());
        out.push(' ');
        out.push_str(&change.path);
        out.push('\n');
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(out.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

/// Remove collected artifacts from a working directory, keeping capture files.
pub async fn discard_artifacts(pot_dir: &Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(pot_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else if !name.to_str().is_some_and(layout::is_capture_file) {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
