//! Filesystem layout under the output root.
//!
//! ```text
//! <root>/
//!   <pot>/                          working directory (capture + artifacts)
//!     network_<ts>.pcap
//!     container.log | container.diff | container.top | dump.tar
//!     <container>/...               per-container subdirectories for multi-container pots
//!     hash.json
//!   <pot>_<ts>.tar.gz               archived bundle
//!   <pot>_<ts>_failed/              preserved evidence of a failed rotation
//!   <pot>_<ts>_interrupted/         preserved evidence of a crash mid-rotation
//!   .rotation/<pot>.json            rotation journal
//! ```

use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "container.log";
pub const DIFF_FILE: &str = "container.diff";
pub const TOP_FILE: &str = "container.top";
pub const DUMP_FILE: &str = "dump.tar";
pub const MANIFEST_FILE: &str = "hash.json";
pub const JOURNAL_DIR: &str = ".rotation";

/// Working directory of a pot
#[must_use]
pub fn pot_dir(root: &Path, pot: &str) -> PathBuf {
    root.join(pot)
}

/// Fresh capture file path in `dir`; never reuses an existing file.
#[must_use]
pub fn capture_file_path(dir: &Path, unix_secs: i64) -> PathBuf {
    unique_path(dir, &format!("network_{unix_secs}"), Some("pcap"))
}

/// Whether `name` is a capture file written by the capture supervisor
#[must_use]
pub fn is_capture_file(name: &str) -> bool {
    name.strip_prefix("network_")
        .and_then(|rest| rest.strip_suffix(".pcap"))
        .is_some_and(|stamp| !stamp.is_empty())
}

#[must_use]
pub fn archive_path(root: &Path, pot: &str, unix_secs: i64) -> PathBuf {
    root.join(format!("{pot}_{unix_secs}.tar.gz"))
}

/// Temporary name the archive is written under before the final rename
#[must_use]
pub fn partial_archive_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

#[must_use]
pub fn failed_dir(root: &Path, pot: &str, unix_secs: i64) -> PathBuf {
    unique_path(root, &format!("{pot}_{unix_secs}_failed"), None)
}

#[must_use]
pub fn interrupted_dir(root: &Path, pot: &str, unix_secs: i64) -> PathBuf {
    unique_path(root, &format!("{pot}_{unix_secs}_interrupted"), None)
}

#[must_use]
pub fn journal_dir(root: &Path) -> PathBuf {
    root.join(JOURNAL_DIR)
}

#[must_use]
pub fn journal_path(root: &Path, pot: &str) -> PathBuf {
    journal_dir(root).join(format!("{pot}.json"))
}

/// `base_dir/<stem>[.ext]`, or the first free `<stem>_NN[.ext]` variant.
#[must_use]
pub fn unique_path(base_dir: &Path, stem: &str, ext: Option<&str>) -> PathBuf {
    let name = |suffix: String| match ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    let mut candidate = base_dir.join(name(String::new()));
    if !candidate.exists() {
        return candidate;
    }
    for idx in 1..=1000 {
        candidate = base_dir.join(name(format!("_{idx:02}")));
        if !candidate.exists() {
            return candidate;
        }
    }
    candidate
}
