use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// Per-path cooldown collapsing bursts of filesystem events into one
/// dispatch.
pub struct Debouncer {
    last_dispatch: Mutex<HashMap<PathBuf, Instant>>,
    cooldown: Duration,
}

impl Debouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            last_dispatch: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    /// True at most once per cooldown window per path. The stamp is updated
    /// only on a true return, so a burst extends from its first event.
    pub fn should_process(&self, path: &Path) -> bool {
        let mut last = self.last_dispatch.lock().expect("debounce mutex poisoned");
        let now = Instant::now();
        if let Some(stamp) = last.get(path)
            && now.duration_since(*stamp) < self.cooldown
        {
            return false;
        }
        last.insert(path.to_path_buf(), now);
        true
    }

    pub fn sweep(&self) {
        let cooldown = self.cooldown;
        self.last_dispatch
            .lock()
            .expect("debounce mutex poisoned")
            .retain(|_, stamp| stamp.elapsed() < cooldown);
    }
}

/// Whether a file's mtime predates the watcher start by more than the grace
/// window. Such files existed before the watcher came up; treating their
/// events as "new" would turn a cold start into a bulk upload, which is the
/// reconciler's job.
pub fn is_stale_at_start(
    modified: SystemTime,
    watcher_start: SystemTime,
    grace: Duration,
) -> bool {
    match watcher_start.duration_since(modified) {
        Ok(age) => age > grace,
        Err(_) => false,
    }
}
