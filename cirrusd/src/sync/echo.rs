use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time-windowed set of paths the pipeline itself just wrote. A filesystem
/// event for a recent entry is an echo of our own download, not user intent,
/// and must never turn into an upload.
pub struct EchoSuppressor {
    recent: Mutex<HashMap<PathBuf, Instant>>,
    ttl: Duration,
}

impl EchoSuppressor {
    pub fn new(ttl: Duration) -> Self {
        Self {
            recent: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Records both the given path and its canonicalized form, since the
    /// watcher may report either spelling.
    pub fn mark(&self, path: &Path) {
        let now = Instant::now();
        let mut recent = self.recent.lock().expect("echo mutex poisoned");
        recent.insert(path.to_path_buf(), now);
        if let Ok(canonical) = path.canonicalize()
            && canonical != path
        {
            recent.insert(canonical, now);
        }
    }

    pub fn is_recent(&self, path: &Path) -> bool {
        let recent = self.recent.lock().expect("echo mutex poisoned");
        let fresh = |stamp: &Instant| stamp.elapsed() < self.ttl;
        if recent.get(path).is_some_and(fresh) {
            return true;
        }
        path.canonicalize()
            .is_ok_and(|canonical| recent.get(&canonical).is_some_and(fresh))
    }

    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.recent
            .lock()
            .expect("echo mutex poisoned")
            .retain(|_, stamp| stamp.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.recent.lock().expect("echo mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
