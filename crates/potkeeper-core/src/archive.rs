//! Archiver: packages a pot's working directory into `<pot>_<ts>.tar.gz`.
//!
//! The bundle is written under a `.partial` name and renamed only once it is
//! complete and every entry has been re-hashed against the manifest, so a
//! `*.tar.gz` in the output root is always a verified bundle.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType};
use tracing::{info, warn};

use crate::error::{ArtifactError, Error, Result};
use crate::layout::{self, MANIFEST_FILE};
use crate::manifest::{Manifest, sha256_reader};

/// A finished, verified bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub path: PathBuf,
    /// Regular files verified against the manifest
    pub verified_files: usize,
    pub size_bytes: u64,
}

/// Write `pot_dir` as a gzip tarball at `dest`, entries under `<pot>/`.
pub fn write_archive(pot_dir: &Path, pot: &str, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(pot, pot_dir)?;
    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

/// Re-hash every regular entry of the bundle at `path` against `manifest`.
///
/// Returns the number of verified files. The embedded `hash.json` must be
/// present and equal to `manifest`.
pub fn verify_archive(path: &Path, pot: &str, manifest: &Manifest) -> Result<usize> {
    let decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    let mut archive = Archive::new(decoder);
    let prefix = format!("{pot}/");
    let mut seen = BTreeSet::new();
    let mut embedded_manifest = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let name = entry.path()?.to_string_lossy().replace('\\', "/");
        let Some(key) = name.strip_prefix(&prefix).map(str::to_string) else {
            return Err(ArtifactError::UnexpectedEntry(name).into());
        };

        if key == MANIFEST_FILE {
            let parsed: Manifest = serde_json::from_reader(&mut entry)?;
            embedded_manifest = Some(parsed);
            continue;
        }

        let Some(expected) = manifest.get(&key) else {
            return Err(ArtifactError::UnexpectedEntry(key).into());
        };
        if &sha256_reader(&mut entry)? != expected {
            return Err(ArtifactError::HashMismatch { path: key }.into());
        }
        seen.insert(key);
    }

    if embedded_manifest.as_ref() != Some(manifest) {
        return Err(ArtifactError::HashMismatch {
            path: MANIFEST_FILE.to_string(),
        }
        .into());
    }
    if let Some(missing) = manifest.keys().find(|key| !seen.contains(*key)) {
        return Err(ArtifactError::MissingFromArchive(missing.clone()).into());
    }
    Ok(seen.len())
}

fn build_and_verify(pot_dir: &Path, pot: &str, dest: &Path, manifest: &Manifest) -> Result<ArchiveReport> {
    let partial = layout::partial_archive_path(dest);
    let outcome = write_archive(pot_dir, pot, &partial)
        .and_then(|()| verify_archive(&partial, pot, manifest))
        .and_then(|verified| {
            fs::rename(&partial, dest)?;
            Ok(verified)
        });
    match outcome {
        Ok(verified_files) => Ok(ArchiveReport {
            path: dest.to_path_buf(),
            verified_files,
            size_bytes: fs::metadata(dest)?.len(),
        }),
        Err(e) => {
            if let Err(rm) = fs::remove_file(&partial) {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %rm, "Failed to remove partial archive");
                }
            }
            Err(e)
        }
    }
}

/// Archive and verify a pot directory off the async runtime.
pub async fn archive_pot(
    pot_dir: &Path,
    pot: &str,
    dest: &Path,
    manifest: &Manifest,
) -> Result<ArchiveReport> {
    let pot_dir = pot_dir.to_path_buf();
    let pot = pot.to_string();
    let dest = dest.to_path_buf();
    let manifest = manifest.clone();
    let report = tokio::task::spawn_blocking(move || build_and_verify(&pot_dir, &pot, &dest, &manifest))
        .await
        .map_err(|e| Error::Runtime(format!("archive task failed: {e}")))??;
    info!(
        path = %report.path.display(),
        files = report.verified_files,
        size_bytes = report.size_bytes,
        "Archive written and verified"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{build_manifest, sha256_bytes, write_manifest};

    fn pot_fixture(root: &Path) -> (PathBuf, Manifest) {
        let dir = root.join("cowrie01");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("container.log"), b"login attempt root/123456\n").unwrap();
        fs::write(dir.join("container.diff"), b"C /etc\nA /etc/shadow-\n").unwrap();
        fs::write(dir.join("sub").join("dump.tar"), vec![7u8; 4096]).unwrap();
        let manifest = build_manifest(&dir).unwrap();
        write_manifest(&dir, &manifest).unwrap();
        (dir, manifest)
    }

    #[test]
    fn archive_roundtrip_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, manifest) = pot_fixture(tmp.path());
        let dest = tmp.path().join("cowrie01_100.tar.gz");
        let report = build_and_verify(&dir, "cowrie01", &dest, &manifest).unwrap();
        assert_eq!(report.verified_files, 3);
        assert!(dest.exists());
        assert!(!layout::partial_archive_path(&dest).exists());
        assert!(report.size_bytes > 0);
    }

    #[test]
    fn archive_entries_are_prefixed_with_pot() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, _) = pot_fixture(tmp.path());
        let dest = tmp.path().join("out.tar.gz");
        write_archive(&dir, "cowrie01", &dest).unwrap();

        let mut archive = Archive::new(GzDecoder::new(File::open(&dest).unwrap()));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .filter(|n| !n.ends_with('/'))
            .collect();
        names.sort();
        assert!(names.contains(&"cowrie01/container.log".to_string()));
        assert!(names.contains(&"cowrie01/sub/dump.tar".to_string()));
        assert!(names.contains(&"cowrie01/hash.json".to_string()));
    }

    #[test]
    fn tampered_manifest_fails_and_removes_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, mut manifest) = pot_fixture(tmp.path());
        manifest.insert("container.log".to_string(), sha256_bytes(b"other"));
        let dest = tmp.path().join("cowrie01_1.tar.gz");
        let err = build_and_verify(&dir, "cowrie01", &dest, &manifest).unwrap_err();
        assert!(matches!(err, Error::Artifact(ArtifactError::HashMismatch { .. })));
        assert!(!dest.exists());
        assert!(!layout::partial_archive_path(&dest).exists());
    }

    #[test]
    fn file_added_after_hashing_is_unexpected() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, manifest) = pot_fixture(tmp.path());
        fs::write(dir.join("late.txt"), b"late").unwrap();
        let dest = tmp.path().join("x.tar.gz");
        let err = build_and_verify(&dir, "cowrie01", &dest, &manifest).unwrap_err();
        assert!(matches!(err, Error::Artifact(ArtifactError::UnexpectedEntry(_))));
    }

    #[test]
    fn file_removed_after_hashing_is_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, manifest) = pot_fixture(tmp.path());
        fs::remove_file(dir.join("container.diff")).unwrap();
        let dest = tmp.path().join("x.tar.gz");
        let err = build_and_verify(&dir, "cowrie01", &dest, &manifest).unwrap_err();
        assert!(matches!(
            err,
            Error::Artifact(ArtifactError::MissingFromArchive(ref k)) if k == "container.diff"
        ));
    }

    #[tokio::test]
    async fn archive_pot_runs_off_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, manifest) = pot_fixture(tmp.path());
        let dest = layout::archive_path(tmp.path(), "cowrie01", 1_700_000_000);
        let report = archive_pot(&dir, "cowrie01", &dest, &manifest).await.unwrap();
        assert_eq!(report.path, dest);
    }
}
