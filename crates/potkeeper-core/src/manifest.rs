//! Fingerprinter: SHA-256 manifest of a pot's artifact directory.
//!
//! The manifest maps each regular file's path relative to the pot directory
//! (`/`-separated; the bare file name for single-container pots) to its
//! lowercase hex digest. It is written as `hash.json` after every other file
//! is final, and never lists itself.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::layout::MANIFEST_FILE;

/// Relative path to hex SHA-256
pub type Manifest = BTreeMap<String, String>;

const TEMP_SUFFIX: &str = ".tmp";

/// Compute SHA-256 of a file without loading it into memory.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = fs::File::open(path)?;
    sha256_reader(BufReader::with_capacity(64 * 1024, file))
}

/// Compute SHA-256 of everything `reader` yields.
pub fn sha256_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute SHA-256 of bytes.
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn manifest_key(dir: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(dir).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn is_manifest_file(key: &str) -> bool {
    key == MANIFEST_FILE || key == format!("{MANIFEST_FILE}{TEMP_SUFFIX}")
}

/// Hash every regular file under `dir` except the manifest itself.
pub fn build_manifest(dir: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = manifest_key(dir, entry.path()) else {
            return Err(Error::Io(std::io::Error::other(format!(
                "non UTF-8 artifact path {}",
                entry.path().display()
            ))));
        };
        if is_manifest_file(&key) {
            continue;
        }
        let digest = sha256_file(entry.path())?;
        manifest.insert(key, digest);
    }
    Ok(manifest)
}

/// Write `manifest` into `dir` atomically and return the manifest path.
pub fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<PathBuf> {
    let path = dir.join(MANIFEST_FILE);
    let tmp = dir.join(format!("{MANIFEST_FILE}{TEMP_SUFFIX}"));
    let json = serde_json::to_vec_pretty(manifest)?;
    fs::write(&tmp, json)?;
    fs::File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

pub fn read_manifest(dir: &Path) -> Result<Manifest> {
    let raw = fs::read(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Hash the pot directory and write `hash.json`, off the async runtime.
pub async fn fingerprint(dir: &Path) -> Result<Manifest> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let manifest = build_manifest(&dir)?;
        write_manifest(&dir, &manifest)?;
        debug!(dir = %dir.display(), files = manifest.len(), "Manifest written");
        Ok(manifest)
    })
    .await
    .map_err(|e| Error::Runtime(format!("fingerprint task failed: {e}")))?
}
