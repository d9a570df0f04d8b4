//! Filesystem layout helpers: cycle file naming and file creation.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{ProbeError, ProbeResult};

/// Extension carried by every probe log cycle file.
pub const PROBE_FILE_EXTENSION: &str = "qprobe";

/// File-per-cycle naming: `<stem>-<cycle_start_millis>.qprobe`.
///
/// The configured path supplies the directory and stem; each roll cycle gets
/// its own immutable file named by the cycle start timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleFileName {
    pub cycle_start_millis: i64,
}

impl CycleFileName {
    pub fn new(cycle_start_millis: i64) -> Self {
        Self { cycle_start_millis }
    }

    /// Resolves the on-disk path for this cycle next to `base`.
    pub fn resolve(&self, base: &Path) -> PathBuf {
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "probes".to_string());
        let name = format!(
            "{}-{}.{}",
            stem, self.cycle_start_millis, PROBE_FILE_EXTENSION
        );
        base.with_file_name(name)
    }

    /// Parses a cycle start timestamp back out of a file name produced by
    /// [`resolve`](Self::resolve).
    pub fn parse(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        if path.extension()?.to_str()? != PROBE_FILE_EXTENSION {
            return None;
        }
        let (_, millis) = stem.rsplit_once('-')?;
        millis.parse::<i64>().ok().map(Self::new)
    }
}

/// Opens (creating if absent) the backing file for a log, ensuring its
/// parent directory exists and the file spans at least `len` bytes.
pub fn open_log_file(path: &Path, len: u64) -> ProbeResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let current = file.metadata()?.len();
    if current < len {
        file.set_len(len)?;
    }
    Ok(file)
}

/// Canonicalizes a configured log path for registry keying. The file itself
/// may not exist yet, so the parent directory is canonicalized instead.
pub fn canonical_registry_key(path: &Path) -> ProbeResult<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| ProbeError::invalid_config(format!("path {:?} has no file name", path)))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let canonical_parent = parent.canonicalize()?;
    Ok(canonical_parent.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cycle_name_round_trip() {
        let base = Path::new("/var/probes/orders.qprobe");
        let name = CycleFileName::new(1_700_000_000_000);
        let resolved = name.resolve(base);
        assert_eq!(
            resolved,
            Path::new("/var/probes/orders-1700000000000.qprobe")
        );
        assert_eq!(CycleFileName::parse(&resolved), Some(name));
    }

    #[test]
    fn parse_rejects_foreign_files() {
        assert_eq!(CycleFileName::parse(Path::new("/tmp/orders.log")), None);
        assert_eq!(CycleFileName::parse(Path::new("/tmp/orders.qprobe")), None);
    }

    #[test]
    fn open_extends_file() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("nested").join("log.qprobe");
        let file = open_log_file(&path, 8192).expect("open");
        assert_eq!(file.metadata().expect("meta").len(), 8192);
        // Re-opening with a smaller length never shrinks.
        let file = open_log_file(&path, 4096).expect("reopen");
        assert_eq!(file.metadata().expect("meta").len(), 8192);
    }

    #[test]
    fn registry_key_is_stable() {
        let tmp = TempDir::new().expect("tempdir");
        let a = tmp.path().join("log.qprobe");
        let b = tmp.path().join(".").join("log.qprobe");
        let key_a = canonical_registry_key(&a).expect("key");
        let key_b = canonical_registry_key(&b).expect("key");
        assert_eq!(key_a, key_b);
    }
}
