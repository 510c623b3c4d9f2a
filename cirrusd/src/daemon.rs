use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cirrus_core::{AuthMode, CirrusClient};
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::events::{EventBus, SyncEvent};
use crate::storage::{CredentialStore, SessionState};
use crate::sync::coordinator::{CoordinatorConfig, SyncCoordinator};
use crate::sync::echo::EchoSuppressor;
use crate::sync::pipeline::{PipelineConfig, TransferPipeline};
use crate::sync::store::MetadataStore;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct DaemonRuntime {
    config: DaemonConfig,
    coordinator: SyncCoordinator,
    events: Arc<EventBus>,
    echo: Arc<EchoSuppressor>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;

        let session = load_session();
        let auth = resolve_auth(&session)?;
        let workspace_id = config
            .workspace_id
            .or(session.workspace_id)
            .context("no workspace selected: set CIRRUS_WORKSPACE_ID or sign in")?;

        let client = match &config.base_url {
            Some(base_url) => CirrusClient::with_base_url(base_url, auth)?,
            None => CirrusClient::new(auth)?,
        };
        let store = Arc::new(
            MetadataStore::new_default()
                .await
                .context("failed to initialize metadata store")?,
        );
        let events = Arc::new(EventBus::new());
        let echo = Arc::new(EchoSuppressor::new(config.echo_ttl));
        let pipeline = Arc::new(TransferPipeline::new(
            client.clone(),
            Arc::clone(&events),
            PipelineConfig {
                max_concurrent_transfers: config.max_concurrent_transfers,
                large_file_threshold: config.large_file_threshold,
            },
            CancellationToken::new(),
        ));

        let coordinator = SyncCoordinator::new(
            client,
            store,
            pipeline,
            Arc::clone(&echo),
            Arc::clone(&events),
            CoordinatorConfig {
                base_sync_root: config.sync_root.clone(),
                periodic_interval: config.periodic_interval,
                settle_delay: config.settle_delay,
                pass_deadline: config.pass_deadline,
                start_grace: config.start_grace,
                debounce: config.debounce,
                excluded_dirs: config.excluded_dir_names.clone(),
            },
            workspace_id,
        )
        .await?;

        Ok(Self {
            config,
            coordinator,
            events,
            echo,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[cirrusd] started: sync_root={}, workspace_root={}, interval={}s",
            self.config.sync_root.display(),
            self.coordinator.workspace_root().display(),
            self.config.periodic_interval.as_secs()
        );

        let log_handle = spawn_event_log(Arc::clone(&self.events));

        let echo = Arc::clone(&self.echo);
        let sweep_interval = (self.config.echo_ttl / 4).max(MIN_SWEEP_INTERVAL);
        let sweep_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;
                echo.sweep();
            }
        });

        let handle = self.coordinator.handle();
        let coordinator_handle = tokio::spawn(self.coordinator.run());

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        eprintln!("[cirrusd] shutting down");
        handle.shutdown();
        coordinator_handle
            .await
            .context("coordinator task panicked")??;

        sweep_handle.abort();
        log_handle.abort();
        Ok(())
    }
}

fn load_session() -> SessionState {
    match CredentialStore::new().and_then(|store| store.load()) {
        Ok(session) => session,
        Err(_) => SessionState::default(),
    }
}

/// Session cookies are preferred; a bearer token is the fallback. Env
/// variables override the secure store for headless runs.
fn resolve_auth(session: &SessionState) -> anyhow::Result<AuthMode> {
    if let Ok(cookie) = std::env::var("CIRRUS_SESSION_COOKIE") {
        return AuthMode::session_from_cookies(cookie)
            .context("CIRRUS_SESSION_COOKIE is missing a cirrus_csrf cookie");
    }
    if let Ok(token) = std::env::var("CIRRUS_BEARER_TOKEN") {
        return Ok(AuthMode::bearer(token));
    }
    if let Some(cookie) = &session.session_cookie
        && let Some(auth) = AuthMode::session_from_cookies(cookie.clone())
    {
        return Ok(auth);
    }
    if let Some(token) = &session.bearer_token {
        return Ok(AuthMode::bearer(token.clone()));
    }
    anyhow::bail!("no credentials found: sign in or set CIRRUS_SESSION_COOKIE")
}

fn spawn_event_log(events: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SyncEvent::PassProgress {
                    stage,
                    percentage,
                    current_path,
                } => {
                    if !current_path.is_empty() {
                        eprintln!("[cirrusd] {stage:?} {percentage}% {current_path}");
                    }
                }
                SyncEvent::TransferProgress {
                    file_name,
                    bytes_sent,
                    bytes_total,
                    mib_per_sec,
                    eta_seconds,
                } => {
                    eprintln!(
                        "[cirrusd] transfer {file_name}: {bytes_sent}/{bytes_total} bytes ({mib_per_sec:.1} MiB/s, ~{eta_seconds}s left)"
                    );
                }
                SyncEvent::PassCompleted {
                    uploads,
                    downloads,
                    folders_created,
                    deferred,
                } => {
                    eprintln!(
                        "[cirrusd] pass complete: {uploads} up, {downloads} down, {folders_created} folders, {deferred} deferred"
                    );
                }
                SyncEvent::Error { message } => eprintln!("[cirrusd] error: {message}"),
                SyncEvent::ReauthRequired => {
                    eprintln!("[cirrusd] session expired; sign in again to resume sync");
                }
                SyncEvent::FsChange { change, path, old_path } => match old_path {
                    Some(old_path) => {
                        eprintln!("[cirrusd] fs {change:?}: {old_path} -> {path}");
                    }
                    None => eprintln!("[cirrusd] fs {change:?}: {path}"),
                },
            }
        }
    })
}
