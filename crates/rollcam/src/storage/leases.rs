//! Read leases on segment files
//!
//! An extraction leases the segments it is about to hand to the transcoder.
//! The evictor skips leased paths until the guard is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Shared registry of segments currently being read.
#[derive(Debug, Clone, Default)]
pub struct ReadLeases {
    inner: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl ReadLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease `paths` until the returned guard is dropped.
    ///
    /// Leases are counted, so overlapping extractions can hold the same path.
    pub fn acquire<I>(&self, paths: I) -> LeaseGuard
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().collect();
        {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            for path in &paths {
                *map.entry(path.clone()).or_insert(0) += 1;
            }
        }
        LeaseGuard {
            leases: self.clone(),
            paths,
        }
    }

    pub fn is_leased(&self, path: &Path) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.contains_key(path)
    }

    /// Delete `path` unless it is leased.
    ///
    /// The check and the removal happen under the registry lock, so a lease
    /// taken by [`acquire`](Self::acquire) either blocks the deletion or
    /// sees the file already gone. Returns `Ok(false)` for a leased path.
    pub fn remove_unless_leased(&self, path: &Path) -> std::io::Result<bool> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(path) {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    /// Number of distinct leased paths.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, paths: &[PathBuf]) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for path in paths {
            if let Some(count) = map.get_mut(path) {
                *count -= 1;
                if *count == 0 {
                    map.remove(path);
                }
            }
        }
    }
}

/// Releases its leases on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    leases: ReadLeases,
    paths: Vec<PathBuf>,
}

impl LeaseGuard {
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases.release(&self.paths);
    }
}
