use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

const PRUNE_THRESHOLD: usize = 1024;

/// Per-path mutex map. A claimed path runs exactly one handler at a time;
/// an event for an already-claimed path is dropped by the watcher.
#[derive(Default)]
pub struct PathLocks {
    inner: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct PathClaim {
    _guard: OwnedMutexGuard<()>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the path without waiting; None while another handler holds it.
    pub fn try_claim(&self, path: &Path) -> Option<PathClaim> {
        let lock = {
            let mut inner = self.inner.lock().expect("path lock mutex poisoned");
            if inner.len() > PRUNE_THRESHOLD {
                inner.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(inner.entry(path.to_path_buf()).or_default())
        };
        lock.try_lock_owned().ok().map(|guard| PathClaim { _guard: guard })
    }
}

/// Per-pass set of normalized relative paths with an upload already in
/// flight. The scoped guard removes its key on drop, so a failed upload
/// frees the path for the next walk.
#[derive(Default, Clone)]
pub struct InFlightPaths {
    inner: Arc<Mutex<HashSet<String>>>,
}

pub struct FlightTicket {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the key; None when some other walk already holds it.
    pub fn reserve(&self, key: &str) -> Option<FlightTicket> {
        let mut inner = self.inner.lock().expect("in-flight mutex poisoned");
        if !inner.insert(key.to_string()) {
            return None;
        }
        Some(FlightTicket {
            set: Arc::clone(&self.inner),
            key: key.to_string(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .lock()
            .expect("in-flight mutex poisoned")
            .contains(key)
    }
}

impl Drop for FlightTicket {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight mutex poisoned")
            .remove(&self.key);
    }
}
