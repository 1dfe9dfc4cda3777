//! Rotation journal.
//!
//! Each rotation records its progress in `<root>/.rotation/<pot>.json`. The
//! record is rewritten atomically at every stage transition and deleted when
//! the rotation completes, so a record left `in_progress` at startup means the
//! previous process died mid-rotation.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::layout;

/// Rotation stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStage {
    Collecting,
    CaptureStopped,
    Hashed,
    Archived,
    Replaced,
    CaptureResumed,
}

impl RotationStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::CaptureStopped => "capture_stopped",
            Self::Hashed => "hashed",
            Self::Archived => "archived",
            Self::Replaced => "replaced",
            Self::CaptureResumed => "capture_resumed",
        }
    }
}

impl std::fmt::Display for RotationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalStatus {
    InProgress,
    Failed,
    Interrupted,
}

/// Persisted state of one pot's rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRecord {
    pub pot: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stage: RotationStage,
    pub status: JournalStatus,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub archive: Option<PathBuf>,
    /// Where evidence was moved after a failure or crash
    #[serde(default)]
    pub preserved_dir: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Journal rooted at an output directory
#[derive(Debug, Clone)]
pub struct RotationJournal {
    root: PathBuf,
}

impl RotationJournal {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Start a record for `pot`, replacing any earlier failed one.
    pub fn begin(&self, pot: &str, containers: Vec<String>) -> Result<RotationRecord> {
        let now = Utc::now();
        let record = RotationRecord {
            pot: pot.to_string(),
            started_at: now,
            updated_at: now,
            stage: RotationStage::Collecting,
            status: JournalStatus::InProgress,
            containers,
            archive: None,
            preserved_dir: None,
            error: None,
        };
        self.save(&record)?;
        Ok(record)
    }

    pub fn advance(&self, record: &mut RotationRecord, stage: RotationStage) -> Result<()> {
        record.stage = stage;
        record.updated_at = Utc::now();
        self.save(record)
    }

    pub fn fail(
        &self,
        record: &mut RotationRecord,
        error: &str,
        preserved_dir: Option<PathBuf>,
    ) -> Result<()> {
        record.status = JournalStatus::Failed;
        record.error = Some(error.to_string());
        record.preserved_dir = preserved_dir;
        record.updated_at = Utc::now();
        self.save(record)
    }

    /// Remove the record of a finished rotation.
    pub fn complete(&self, record: &RotationRecord) -> Result<()> {
        match fs::remove_file(layout::journal_path(&self.root, &record.pot)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, record: &RotationRecord) -> Result<()> {
        let dir = layout::journal_dir(&self.root);
        fs::create_dir_all(&dir)?;
        let path = layout::journal_path(&self.root, &record.pot);
        let tmp = dir.join(format!(".{}.json.tmp", record.pot));
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// All records, sorted by pot. Unreadable records are logged and skipped.
    pub fn list(&self) -> Result<Vec<RotationRecord>> {
        let dir = layout::journal_dir(&self.root);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_record {
                continue;
            }
            match fs::read(&path)
                .map_err(crate::Error::from)
                .and_then(|raw| Ok(serde_json::from_slice::<RotationRecord>(&raw)?))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable journal record"),
            }
        }
        records.sort_by(|a, b| a.pot.cmp(&b.pot));
        Ok(records)
    }

    /// Mark rotations left in progress by a previous process as interrupted.
    ///
    /// Each such pot's working directory is moved aside to
    /// `<pot>_<ts>_interrupted` and any partial archive is removed.
    pub fn recover_interrupted(&self) -> Result<Vec<RotationRecord>> {
        let mut recovered = Vec::new();
        for mut record in self.list()? {
            if record.status != JournalStatus::InProgress {
                continue;
            }
            let pot_dir = layout::pot_dir(&self.root, &record.pot);
            if pot_dir.exists() {
                let dest = layout::interrupted_dir(&self.root, &record.pot, Utc::now().timestamp());
                fs::rename(&pot_dir, &dest)?;
                record.preserved_dir = Some(dest);
            }
            if let Some(archive) = &record.archive {
                remove_if_exists(&layout::partial_archive_path(archive))?;
            }
            remove_partial_archives(&self.root, &record.pot)?;
            record.status = JournalStatus::Interrupted;
            record.updated_at = Utc::now();
            self.save(&record)?;
            warn!(
                pot = %record.pot,
                stage = %record.stage,
                preserved = ?record.preserved_dir,
                "Recovered interrupted rotation"
            );
            recovered.push(record);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Interrupted rotations recovered");
        }
        Ok(recovered)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_partial_archives(root: &Path, pot: &str) -> Result<()> {
    let prefix = format!("{pot}_");
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(".tar.gz.partial") {
            remove_if_exists(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_advance_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = RotationJournal::new(tmp.path());
        let mut record = journal.begin("cowrie01", vec!["ssh".to_string()]).unwrap();
        assert_eq!(record.status, JournalStatus::InProgress);

        journal.advance(&mut record, RotationStage::Hashed).unwrap();
        let listed = journal.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].stage, RotationStage::Hashed);

        journal.complete(&record).unwrap();
        assert!(journal.list().unwrap().is_empty());
        journal.complete(&record).unwrap();
    }

    #[test]
    fn failed_record_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = RotationJournal::new(tmp.path());
        let mut record = journal.begin("p", Vec::new()).unwrap();
        journal
            .fail(&mut record, "archive failed", Some(tmp.path().join("p_1_failed")))
            .unwrap();
        let listed = journal.list().unwrap();
        assert_eq!(listed[0].status, JournalStatus::Failed);
        assert_eq!(listed[0].error.as_deref(), Some("archive failed"));
    }

    #[test]
    fn stages_serialize_snake_case_and_are_ordered() {
        assert_eq!(
            serde_json::to_string(&RotationStage::CaptureStopped).unwrap(),
            "\"capture_stopped\""
        );
        assert!(RotationStage::Collecting < RotationStage::CaptureResumed);
        assert_eq!(RotationStage::Archived.to_string(), "archived");
    }

    #[test]
    fn recover_moves_working_dir_aside() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let journal = RotationJournal::new(root);
        let mut record = journal.begin("cowrie01", vec!["ssh".to_string()]).unwrap();
        journal.advance(&mut record, RotationStage::Hashed).unwrap();
        fs::create_dir_all(root.join("cowrie01")).unwrap();
        fs::write(root.join("cowrie01").join("container.log"), b"x").unwrap();
        fs::write(root.join("cowrie01_5.tar.gz.partial"), b"half").unwrap();
        // A finished record for another pot is untouched.
        let mut other = journal.begin("glastopf", Vec::new()).unwrap();
        journal.fail(&mut other, "boom", None).unwrap();

        let recovered = journal.recover_interrupted().unwrap();
        assert_eq!(recovered.len(), 1);
        let preserved = recovered[0].preserved_dir.clone().unwrap();
        assert!(preserved.join("container.log").exists());
        assert!(
            preserved
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .ends_with("_interrupted")
        );
        assert!(!root.join("cowrie01").exists());
        assert!(!root.join("cowrie01_5.tar.gz.partial").exists());

        let listed = journal.list().unwrap();
        assert_eq!(listed[0].status, JournalStatus::Interrupted);
        assert_eq!(listed[1].status, JournalStatus::Failed);

        // Nothing left to recover on a second start.
        assert!(journal.recover_interrupted().unwrap().is_empty());
    }

    #[test]
    fn list_skips_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = layout::journal_dir(tmp.path());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("broken.json"), b"{").unwrap();
        fs::write(dir.join("notes.txt"), b"hi").unwrap();
        assert!(RotationJournal::new(tmp.path()).list().unwrap().is_empty());
    }

    #[test]
    fn list_without_journal_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(RotationJournal::new(tmp.path()).list().unwrap().is_empty());
    }
}
