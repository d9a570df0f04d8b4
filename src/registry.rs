//! Process-wide path ownership registry.
//!
//! One writer per path: constructing an instrumented queue registers its
//! canonical log path here and fails fast on conflict. The registry is an
//! injected, explicitly-owned value rather than a static singleton so tests
//! can isolate instances.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ProbeError, ProbeResult};
use crate::fs::canonical_registry_key;

#[derive(Default)]
struct RegistryInner {
    paths: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

/// Cheaply cloneable handle to a shared path registry.
#[derive(Clone, Default)]
pub struct PathRegistry {
    inner: Arc<RegistryInner>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path` for a new instance. If the path is held by a close in
    /// progress, waits up to `timeout` for it to be released; a path still
    /// held after that is a conflict.
    pub fn register(&self, path: &Path, timeout: Duration) -> ProbeResult<PathBuf> {
        let key = canonical_registry_key(path)?;
        let deadline = Instant::now() + timeout;
        let mut paths = self.inner.paths.lock();
        loop {
            if !paths.contains(&key) {
                paths.insert(key.clone());
                return Ok(key);
            }
            if self
                .inner
                .released
                .wait_until(&mut paths, deadline)
                .timed_out()
            {
                return Err(ProbeError::PathConflict(key));
            }
        }
    }

    /// Releases a previously registered key; called at the end of close.
    pub fn deregister(&self, key: &Path) {
        let mut paths = self.inner.paths.lock();
        paths.remove(key);
        self.inner.released.notify_all();
    }

    #[cfg(test)]
    fn contains(&self, key: &Path) -> bool {
        self.inner.paths.lock().contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn register_then_conflict() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("log.qprobe");
        let registry = PathRegistry::new();
        let key = registry
            .register(&path, Duration::from_millis(10))
            .expect("first registration");
        assert!(registry.contains(&key));

        let err = registry
            .register(&path, Duration::from_millis(10))
            .expect_err("duplicate must conflict");
        assert!(matches!(err, ProbeError::PathConflict(_)));
    }

    #[test]
    fn deregister_releases_path() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("log.qprobe");
        let registry = PathRegistry::new();
        let key = registry
            .register(&path, Duration::from_millis(10))
            .expect("register");
        registry.deregister(&key);
        registry
            .register(&path, Duration::from_millis(10))
            .expect("re-register after release");
    }

    #[test]
    fn register_waits_for_close_in_progress() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("log.qprobe");
        let registry = PathRegistry::new();
        let key = registry
            .register(&path, Duration::from_millis(10))
            .expect("register");

        let late_release = registry.clone();
        let release_key = key.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            late_release.deregister(&release_key);
        });

        registry
            .register(&path, Duration::from_secs(2))
            .expect("waits out the in-progress close");
        handle.join().expect("join");
    }

    #[test]
    fn distinct_paths_do_not_conflict() {
        let tmp = TempDir::new().expect("tempdir");
        let registry = PathRegistry::new();
        registry
            .register(&tmp.path().join("a.qprobe"), Duration::from_millis(10))
            .expect("a");
        registry
            .register(&tmp.path().join("b.qprobe"), Duration::from_millis(10))
            .expect("b");
    }
}
