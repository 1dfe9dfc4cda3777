//! Read-only view of an output root for `potkeeper status`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::journal::{JournalStatus, RotationJournal, RotationRecord};
use crate::layout;
use crate::pot::validate_pot_name;

/// Working directory of a pot that is capturing or mid-rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkingDir {
    pub pot: String,
    pub path: PathBuf,
    pub capture_files: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Snapshot of an output root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub root: PathBuf,
    pub working: Vec<WorkingDir>,
    pub archives: Vec<ArchiveEntry>,
    /// Directories preserved after failed or interrupted rotations
    pub preserved: Vec<PathBuf>,
    pub in_progress: Vec<RotationRecord>,
    pub failed: Vec<RotationRecord>,
    pub interrupted: Vec<RotationRecord>,
}

impl StatusReport {
    /// Whether any rotation needs operator attention
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        !self.failed.is_empty() || !self.interrupted.is_empty()
    }
}

/// Scan `root` without touching anything.
pub fn scan(root: &Path) -> Result<StatusReport> {
    let mut report = StatusReport {
        root: root.to_path_buf(),
        ..StatusReport::default()
    };

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if name.ends_with("_failed") || name.ends_with("_interrupted") {
                report.preserved.push(path);
            } else if validate_pot_name(&name).is_ok() {
                report.working.push(working_dir(name, path)?);
            }
        } else if file_type.is_file() && name.ends_with(".tar.gz") {
            report.archives.push(ArchiveEntry {
                size_bytes: entry.metadata()?.len(),
                path,
            });
        }
    }

    for record in RotationJournal::new(root).list()? {
        match record.status {
            JournalStatus::InProgress => report.in_progress.push(record),
            JournalStatus::Failed => report.failed.push(record),
            JournalStatus::Interrupted => report.interrupted.push(record),
        }
    }

    report.working.sort_by(|a, b| a.pot.cmp(&b.pot));
    report.archives.sort_by(|a, b| a.path.cmp(&b.path));
    report.preserved.sort();
    Ok(report)
}

fn working_dir(pot: String, path: PathBuf) -> Result<WorkingDir> {
    let mut capture_files = 0;
    let mut size_bytes = 0;
    for entry in walkdir::WalkDir::new(&path).follow_links(false) {
        let entry = entry.map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_str().is_some_and(layout::is_capture_file) {
            capture_files += 1;
        }
        size_bytes += entry
            .metadata()
            .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?
            .len();
    }
    Ok(WorkingDir {
        pot,
        path,
        capture_files,
        size_bytes,
    })
}
