use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use cirrus_core::{ApiErrorClass, CirrusClient};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::context::WorkspaceContext;
use super::debounce::Debouncer;
use super::echo::EchoSuppressor;
use super::guard::PathLocks;
use super::handlers::EventHandlers;
use super::paths::workspace_dir_name;
use super::pipeline::{PipelineError, TransferPipeline};
use super::reconcile::{ReconcileError, Reconciler};
use super::store::MetadataStore;
use super::watcher::{SyncWatcher, WatchFilters, start_sync_watcher};
use crate::events::{EventBus, SyncEvent};

#[derive(Debug)]
pub enum CoordinatorCommand {
    SwitchWorkspace(i64),
    TriggerSync,
    Shutdown,
}

/// Control surface handed to the UI layer. Switching workspaces flips the
/// live id first, so an in-flight pass aborts at its next guard, then the
/// queued command drives the restart.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
    current_workspace: Arc<AtomicI64>,
}

impl CoordinatorHandle {
    pub fn switch_workspace(&self, workspace_id: i64) {
        self.current_workspace.store(workspace_id, Ordering::SeqCst);
        let _ = self
            .commands
            .send(CoordinatorCommand::SwitchWorkspace(workspace_id));
    }

    pub fn trigger_sync(&self) {
        let _ = self.commands.send(CoordinatorCommand::TriggerSync);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(CoordinatorCommand::Shutdown);
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub base_sync_root: PathBuf,
    pub periodic_interval: Duration,
    pub settle_delay: Duration,
    pub pass_deadline: Duration,
    pub start_grace: Duration,
    pub debounce: Duration,
    pub excluded_dirs: HashSet<String>,
}

/// Owns the sync lifecycle: brackets every reconcile pass by stopping the
/// watcher and restarting it afterwards behind an echo barrier, drives the
/// periodic timer, and turns workspace switches into cancel-plus-restart.
pub struct SyncCoordinator {
    client: CirrusClient,
    store: Arc<MetadataStore>,
    pipeline: Arc<TransferPipeline>,
    echo: Arc<EchoSuppressor>,
    events: Arc<EventBus>,
    config: CoordinatorConfig,
    current_workspace: Arc<AtomicI64>,
    workspace_root: PathBuf,
    watcher: Option<SyncWatcher>,
    commands_tx: mpsc::UnboundedSender<CoordinatorCommand>,
    commands_rx: mpsc::UnboundedReceiver<CoordinatorCommand>,
    restart_tx: mpsc::UnboundedSender<()>,
    restart_rx: mpsc::UnboundedReceiver<()>,
    halted: bool,
}

impl SyncCoordinator {
    pub async fn new(
        client: CirrusClient,
        store: Arc<MetadataStore>,
        pipeline: Arc<TransferPipeline>,
        echo: Arc<EchoSuppressor>,
        events: Arc<EventBus>,
        config: CoordinatorConfig,
        workspace_id: i64,
    ) -> anyhow::Result<Self> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let current_workspace = Arc::new(AtomicI64::new(workspace_id));
        let workspace_root =
            resolve_workspace_root(&client, &config.base_sync_root, workspace_id).await;
        tokio::fs::create_dir_all(&workspace_root).await?;

        Ok(Self {
            client,
            store,
            pipeline,
            echo,
            events,
            config,
            current_workspace,
            workspace_root,
            watcher: None,
            commands_tx,
            commands_rx,
            restart_tx,
            restart_rx,
            halted: false,
        })
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            commands: self.commands_tx.clone(),
            current_workspace: Arc::clone(&self.current_workspace),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.reconcile_cycle().await;

        let mut ticker = tokio::time::interval(self.config.periodic_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.halted {
                        continue;
                    }
                    self.check_workspace_rename().await;
                    self.reconcile_cycle().await;
                }
                Some(()) = self.restart_rx.recv() => {
                    // The watcher saw workspace drift; bring it up against
                    // the current workspace.
                    self.stop_watcher();
                    self.refresh_workspace_root().await;
                    self.start_watcher();
                }
                command = self.commands_rx.recv() => match command {
                    Some(CoordinatorCommand::SwitchWorkspace(workspace_id)) => {
                        self.switch_workspace(workspace_id).await;
                    }
                    Some(CoordinatorCommand::TriggerSync) => {
                        if !self.halted {
                            self.reconcile_cycle().await;
                        }
                    }
                    Some(CoordinatorCommand::Shutdown) | None => break,
                }
            }
        }

        self.stop_watcher();
        self.pipeline.cancel_token().cancel();
        // Give in-flight transfers a moment to unwind; uncommitted uploads
        // are deduplicated by the next pass.
        tokio::time::sleep(Duration::from_millis(250)).await;
        Ok(())
    }

    /// Stop the watcher, run one pass, then mark the whole tree as echoes
    /// after a settle delay so the watcher does not replay our own writes.
    async fn reconcile_cycle(&mut self) {
        self.stop_watcher();
        let ctx = WorkspaceContext::capture(&self.current_workspace, CancellationToken::new());
        let reconciler = Reconciler::new(
            self.client.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.echo),
            Arc::clone(&self.events),
            self.config.excluded_dirs.clone(),
            self.workspace_root.clone(),
        );

        match tokio::time::timeout(self.config.pass_deadline, reconciler.run_pass(&ctx)).await {
            Err(_) => {
                ctx.cancel.cancel();
                eprintln!("[cirrusd] reconcile pass exceeded its deadline and was cancelled");
                self.events.error("sync pass timed out");
            }
            Ok(Ok(summary)) => {
                eprintln!(
                    "[cirrusd] reconcile done: uploads={} downloads={} folders={} deferred={}",
                    summary.uploads,
                    summary.downloads,
                    summary.folders_created,
                    summary.deferred
                );
            }
            Ok(Err(ReconcileError::WorkspaceChanged)) => {
                // The switch command queued behind us restarts the cycle
                // against the new workspace.
                eprintln!("[cirrusd] reconcile aborted: workspace changed");
            }
            Ok(Err(ReconcileError::Cancelled)) => {
                eprintln!("[cirrusd] reconcile cancelled");
            }
            Ok(Err(err)) if is_session_expired(&err) => {
                eprintln!("[cirrusd] session expired; periodic sync halted");
                self.halted = true;
                self.events.emit(SyncEvent::ReauthRequired);
            }
            Ok(Err(err)) => {
                eprintln!("[cirrusd] reconcile error: {err}");
                self.events.error(format!("sync failed: {err}"));
            }
        }

        tokio::time::sleep(self.config.settle_delay).await;
        mark_tree_as_echoes(&self.workspace_root, &self.echo);
        self.start_watcher();
    }

    async fn switch_workspace(&mut self, workspace_id: i64) {
        self.current_workspace.store(workspace_id, Ordering::SeqCst);
        self.halted = false;
        self.stop_watcher();
        self.refresh_workspace_root().await;
        self.reconcile_cycle().await;
    }

    async fn refresh_workspace_root(&mut self) {
        let workspace_id = self.current_workspace.load(Ordering::SeqCst);
        self.workspace_root =
            resolve_workspace_root(&self.client, &self.config.base_sync_root, workspace_id).await;
        if let Err(err) = tokio::fs::create_dir_all(&self.workspace_root).await {
            eprintln!(
                "[cirrusd] failed to create workspace root {}: {err}",
                self.workspace_root.display()
            );
        }
    }

    /// A remote workspace rename moves the local directory; every derived
    /// path follows the single `workspace_root` field.
    async fn check_workspace_rename(&mut self) {
        let workspace_id = self.current_workspace.load(Ordering::SeqCst);
        let Ok(info) = self.client.get_workspace(workspace_id).await else {
            return;
        };
        let expected = self
            .config
            .base_sync_root
            .join(workspace_dir_name(workspace_id, &info.name));
        if expected == self.workspace_root {
            return;
        }
        match tokio::fs::rename(&self.workspace_root, &expected).await {
            Ok(()) => {
                eprintln!(
                    "[cirrusd] workspace renamed: {} -> {}",
                    self.workspace_root.display(),
                    expected.display()
                );
                self.workspace_root = expected;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if tokio::fs::create_dir_all(&expected).await.is_ok() {
                    self.workspace_root = expected;
                }
            }
            Err(err) => {
                eprintln!("[cirrusd] workspace directory move failed: {err}");
            }
        }
    }

    fn start_watcher(&mut self) {
        if self.watcher.is_some() {
            return;
        }
        let ctx = WorkspaceContext::capture(&self.current_workspace, CancellationToken::new());
        let handlers = Arc::new(EventHandlers {
            client: self.client.clone(),
            store: Arc::clone(&self.store),
            pipeline: Arc::clone(&self.pipeline),
            echo: Arc::clone(&self.echo),
            events: Arc::clone(&self.events),
            ctx: ctx.clone(),
            sync_root: self.workspace_root.clone(),
        });
        let filters = Arc::new(WatchFilters {
            excluded_dirs: self.config.excluded_dirs.clone(),
            debouncer: Debouncer::new(self.config.debounce),
            echo: Arc::clone(&self.echo),
            started_at: SystemTime::now(),
            start_grace: self.config.start_grace,
        });
        match start_sync_watcher(
            self.workspace_root.clone(),
            handlers,
            filters,
            Arc::new(PathLocks::new()),
            ctx,
            self.restart_tx.clone(),
        ) {
            Ok(watcher) => self.watcher = Some(watcher),
            Err(err) => eprintln!("[cirrusd] failed to start watcher: {err}"),
        }
    }

    fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

/// `<base>/<id>_<sanitized-name>`; the id alone when the name cannot be
/// fetched.
async fn resolve_workspace_root(
    client: &CirrusClient,
    base: &Path,
    workspace_id: i64,
) -> PathBuf {
    let name = client
        .get_workspace(workspace_id)
        .await
        .map(|workspace| workspace.name)
        .unwrap_or_default();
    base.join(workspace_dir_name(workspace_id, &name))
}

fn is_session_expired(err: &ReconcileError) -> bool {
    let classification = match err {
        ReconcileError::Api(api) => api.classification(),
        ReconcileError::Pipeline(PipelineError::Api(api)) => api.classification(),
        _ => None,
    };
    classification == Some(ApiErrorClass::Auth)
}

fn mark_tree_as_echoes(root: &Path, echo: &EchoSuppressor) {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            echo.mark(&path);
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::{AuthMode, CirrusError};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn session_expiry_is_detected_through_both_error_layers() {
        let auth = CirrusError::Api {
            status: reqwest::StatusCode::UNAUTHORIZED,
            body: "expired".into(),
        };
        assert!(is_session_expired(&ReconcileError::Api(auth)));

        let nested = CirrusError::Api {
            status: reqwest::StatusCode::FORBIDDEN,
            body: "expired".into(),
        };
        assert!(is_session_expired(&ReconcileError::Pipeline(
            PipelineError::Api(nested)
        )));

        let transient = CirrusError::Api {
            status: reqwest::StatusCode::BAD_GATEWAY,
            body: "".into(),
        };
        assert!(!is_session_expired(&ReconcileError::Api(transient)));
    }

    #[test]
    fn marking_the_tree_covers_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("A/B");
        std::fs::create_dir_all(&nested).unwrap();
        let file = nested.join("file.txt");
        std::fs::write(&file, b"x").unwrap();

        let echo = EchoSuppressor::new(Duration::from_secs(3600));
        mark_tree_as_echoes(dir.path(), &echo);

        assert!(echo.is_recent(&file));
        assert!(echo.is_recent(&dir.path().join("A")));
    }

    #[tokio::test]
    async fn workspace_root_combines_id_and_sanitized_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/workspaces/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 7,
                "name": "Team: Alpha/Beta"
            })))
            .mount(&server)
            .await;

        let client =
            CirrusClient::with_base_url(&server.uri(), AuthMode::bearer("t")).unwrap();
        let root = resolve_workspace_root(&client, Path::new("/sync"), 7).await;
        assert_eq!(root, PathBuf::from("/sync/7_Team_ Alpha_Beta"));
    }

    #[tokio::test]
    async fn unreachable_workspace_falls_back_to_the_bare_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/workspaces/7"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client =
            CirrusClient::with_base_url(&server.uri(), AuthMode::bearer("t")).unwrap();
        let root = resolve_workspace_root(&client, Path::new("/sync"), 7).await;
        assert_eq!(root, PathBuf::from("/sync/7__"));
    }
}
