use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::context::WorkspaceContext;
use super::debounce::{Debouncer, is_stale_at_start};
use super::echo::EchoSuppressor;
use super::guard::PathLocks;
use super::handlers::EventHandlers;

const NOISE_NAMES: [&str; 2] = ["desktop.ini", "thumbs.db"];
const NOISE_EXTENSIONS: [&str; 2] = ["tmp", "temp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    CreatedFile(PathBuf),
    CreatedFolder(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl WatcherEvent {
    /// The path the filter chain inspects; for renames, the new name.
    fn target(&self) -> &Path {
        match self {
            WatcherEvent::CreatedFile(path)
            | WatcherEvent::CreatedFolder(path)
            | WatcherEvent::Modified(path)
            | WatcherEvent::Removed(path) => path,
            WatcherEvent::Renamed { to, .. } => to,
        }
    }
}

/// The stateful part of the filter chain, shared between the watcher task
/// and the reconciler's local walk (which reuses the name filters).
pub struct WatchFilters {
    pub excluded_dirs: HashSet<String>,
    pub debouncer: Debouncer,
    pub echo: Arc<EchoSuppressor>,
    pub started_at: SystemTime,
    pub start_grace: Duration,
}

impl WatchFilters {
    /// Applies filters 1-4 in order: noise names, excluded directories,
    /// debounce, echo suppression. Drift and the per-path guard follow in
    /// the dispatch loop.
    pub(crate) fn allows(&self, root: &Path, event: &WatcherEvent) -> bool {
        let target = event.target();
        let Some(name) = target.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        if is_noise_name(&name) {
            return false;
        }
        if in_excluded_dir(root, target, &self.excluded_dirs) {
            return false;
        }
        if !self.debouncer.should_process(target) {
            return false;
        }
        if self.echo.is_recent(target) {
            return false;
        }
        if matches!(
            event,
            WatcherEvent::CreatedFile(_) | WatcherEvent::Modified(_)
        ) && let Ok(meta) = std::fs::metadata(target)
            && let Ok(modified) = meta.modified()
            && is_stale_at_start(modified, self.started_at, self.start_grace)
        {
            return false;
        }
        true
    }
}

/// System and scratch names that never represent user content.
pub fn is_noise_name(name: &str) -> bool {
    if name.starts_with('.') || name.starts_with("~$") {
        return true;
    }
    let lower = name.to_lowercase();
    if NOISE_NAMES.contains(&lower.as_str()) {
        return true;
    }
    lower
        .rsplit_once('.')
        .is_some_and(|(_, ext)| NOISE_EXTENSIONS.contains(&ext))
}

/// Whether any directory component of `path` under `root` is excluded.
pub fn in_excluded_dir(root: &Path, path: &Path, excluded: &HashSet<String>) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return true;
    };
    let mut components: Vec<_> = relative.components().collect();
    // The final component is the entry itself, not a containing directory.
    components.pop();
    components.iter().any(|component| {
        let name = component.as_os_str().to_string_lossy();
        excluded.contains(name.as_ref()) || name.starts_with('.')
    })
}

pub fn default_excluded_dirs() -> HashSet<String> {
    [".git", "node_modules", ".vs", ".idea", "bin", "obj", "__pycache__"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub struct SyncWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl SyncWatcher {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Starts the recursive watcher over `root` and the dispatch task feeding
/// filtered events into the handlers. Events surviving the filter chain run
/// one handler per path at a time.
pub fn start_sync_watcher(
    root: PathBuf,
    handlers: Arc<EventHandlers>,
    filters: Arc<WatchFilters>,
    locks: Arc<PathLocks>,
    ctx: WorkspaceContext,
    restart_tx: mpsc::UnboundedSender<()>,
) -> notify::Result<SyncWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for mapped in map_event(event) {
                let _ = tx.send(mapped);
            }
        }
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;

    let task = tokio::spawn(async move {
        let mut drift_reported = false;
        while let Some(event) = rx.recv().await {
            if !filters.allows(&root, &event) {
                continue;
            }
            if ctx.drifted() {
                // This watcher observes a stale workspace; every event is
                // dropped until the coordinator restarts it.
                if !drift_reported {
                    drift_reported = true;
                    let _ = restart_tx.send(());
                }
                continue;
            }
            let Some(claim) = locks.try_claim(event.target()) else {
                continue;
            };
            let handlers = Arc::clone(&handlers);
            tokio::spawn(async move {
                let _claim = claim;
                if let Err(err) = handlers.handle(event).await {
                    eprintln!("[cirrusd] watcher handler error: {err}");
                }
            });
        }
    });

    Ok(SyncWatcher {
        _watcher: watcher,
        task,
    })
}

fn map_event(event: Event) -> Vec<WatcherEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2 {
                return vec![WatcherEvent::Renamed {
                    from: event.paths[0].clone(),
                    to: event.paths[1].clone(),
                }];
            }
            Vec::new()
        }
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .filter_map(|path| map_created_path(&path))
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter_map(|path| map_modified_path(&path))
            .collect(),
        EventKind::Remove(_) => event.paths.into_iter().map(WatcherEvent::Removed).collect(),
        _ => Vec::new(),
    }
}

fn map_created_path(path: &Path) -> Option<WatcherEvent> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if meta.file_type().is_symlink() {
        return None;
    }
    if meta.is_dir() {
        Some(WatcherEvent::CreatedFolder(path.to_path_buf()))
    } else {
        Some(WatcherEvent::CreatedFile(path.to_path_buf()))
    }
}

fn map_modified_path(path: &Path) -> Option<WatcherEvent> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if meta.file_type().is_symlink() || meta.is_dir() {
        return None;
    }
    Some(WatcherEvent::Modified(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_names_are_rejected() {
        assert!(is_noise_name(".DS_Store"));
        assert!(is_noise_name("~$report.docx"));
        assert!(is_noise_name("Desktop.ini"));
        assert!(is_noise_name("Thumbs.db"));
        assert!(is_noise_name("upload.TMP"));
        assert!(is_noise_name("scratch.temp"));
        assert!(!is_noise_name("notes.md"));
        assert!(!is_noise_name("template.txt"));
    }

    #[test]
    fn excluded_directories_cover_nested_paths() {
        let root = PathBuf::from("/sync/7_Team");
        let excluded = default_excluded_dirs();
        assert!(in_excluded_dir(
            &root,
            &root.join("proj/node_modules/pkg/index.js"),
            &excluded
        ));
        assert!(in_excluded_dir(&root, &root.join(".git/HEAD"), &excluded));
        assert!(in_excluded_dir(&root, &root.join("proj/obj/out.o"), &excluded));
        assert!(!in_excluded_dir(&root, &root.join("Docs/a.txt"), &excluded));
        // A file named like an excluded dir is fine; only directories count.
        assert!(!in_excluded_dir(&root, &root.join("Docs/bin"), &excluded));
        // Paths outside the root never pass.
        assert!(in_excluded_dir(&root, Path::new("/elsewhere/a.txt"), &excluded));
    }

    #[test]
    fn maps_create_events_by_entry_kind() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("Docs");
        std::fs::create_dir_all(&dir).unwrap();
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::Any),
            paths: vec![dir.clone(), file.clone()],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(event),
            vec![
                WatcherEvent::CreatedFolder(dir),
                WatcherEvent::CreatedFile(file)
            ]
        );
    }

    #[test]
    fn maps_rename_event_with_both_paths() {
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            paths: vec![
                PathBuf::from("/sync/Docs/A.txt"),
                PathBuf::from("/sync/Docs/B.txt"),
            ],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(event),
            vec![WatcherEvent::Renamed {
                from: "/sync/Docs/A.txt".into(),
                to: "/sync/Docs/B.txt".into(),
            }]
        );
    }

    #[test]
    fn filter_chain_vetoes_echoed_and_debounced_events() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        let file = root.join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let echo = Arc::new(EchoSuppressor::new(Duration::from_secs(3600)));
        let filters = WatchFilters {
            excluded_dirs: default_excluded_dirs(),
            debouncer: Debouncer::new(Duration::from_secs(1)),
            echo: Arc::clone(&echo),
            started_at: SystemTime::now() - Duration::from_secs(5),
            start_grace: Duration::from_secs(60),
        };

        let event = WatcherEvent::Modified(file.clone());
        assert!(filters.allows(&root, &event));
        // Debounce: a second event inside the cooldown is dropped.
        assert!(!filters.allows(&root, &event));

        let other = root.join("b.txt");
        std::fs::write(&other, b"x").unwrap();
        echo.mark(&other);
        assert!(!filters.allows(&root, &WatcherEvent::Modified(other)));
    }

    #[test]
    fn filter_chain_drops_files_predating_watcher_start() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        let file = root.join("old.txt");
        std::fs::write(&file, b"x").unwrap();

        let filters = WatchFilters {
            excluded_dirs: default_excluded_dirs(),
            debouncer: Debouncer::new(Duration::ZERO),
            echo: Arc::new(EchoSuppressor::new(Duration::from_secs(3600))),
            // Watcher "started" an hour from now, so the file long predates it.
            started_at: SystemTime::now() + Duration::from_secs(3600),
            start_grace: Duration::from_secs(60),
        };
        assert!(!filters.allows(&root, &WatcherEvent::CreatedFile(file.clone())));
        // Removal events carry no mtime and are not subject to the check.
        assert!(filters.allows(&root, &WatcherEvent::Removed(file)));
    }
}
