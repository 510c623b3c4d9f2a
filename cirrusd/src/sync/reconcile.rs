use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cirrus_core::{CirrusClient, CirrusError, EntryKind, RemoteEntry};
use futures_util::future::join_all;
use thiserror::Error;

use super::context::WorkspaceContext;
use super::echo::EchoSuppressor;
use super::guard::InFlightPaths;
use super::parse_updated_at;
use super::paths::{PathError, local_path_for};
use super::pipeline::{PipelineError, TransferPipeline};
use super::record_for;
use super::store::{MetadataStore, StoreError};
use super::tree::{PLACEHOLDER_ID, ParentRef, RemoteTreeMap, basename, normalize_key};
use super::watcher::is_noise_name;
use crate::events::{EventBus, PassStage, SyncEvent};

// Last-writer-wins tolerance. Timestamps closer than this are "the same
// instant"; inside the band the local copy wins.
const TIMESTAMP_TOLERANCE_SECS: i64 = 2;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("api error: {0}")]
    Api(#[from] CirrusError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transfer error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("workspace changed during the pass")]
    WorkspaceChanged,
    #[error("pass cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub folders_created: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub deferred: usize,
}

/// One bidirectional reconcile pass: snapshot the remote tree, push
/// local-only folders and files up, pull remote-only and remote-newer files
/// down, then push local-newer files up. Absence alone never deletes
/// anything on either side.
pub struct Reconciler {
    client: CirrusClient,
    store: Arc<MetadataStore>,
    pipeline: Arc<TransferPipeline>,
    echo: Arc<EchoSuppressor>,
    events: Arc<EventBus>,
    excluded_dirs: HashSet<String>,
    sync_root: PathBuf,
}

struct LocalDir {
    rel: String,
    abs: PathBuf,
    depth: usize,
}

struct LocalFile {
    rel: String,
    abs: PathBuf,
    size: u64,
    mtime: i64,
}

impl Reconciler {
    pub fn new(
        client: CirrusClient,
        store: Arc<MetadataStore>,
        pipeline: Arc<TransferPipeline>,
        echo: Arc<EchoSuppressor>,
        events: Arc<EventBus>,
        excluded_dirs: HashSet<String>,
        sync_root: PathBuf,
    ) -> Self {
        Self {
            client,
            store,
            pipeline,
            echo,
            events,
            excluded_dirs,
            sync_root,
        }
    }

    pub async fn run_pass(&self, ctx: &WorkspaceContext) -> Result<PassSummary, ReconcileError> {
        let mut summary = PassSummary::default();
        let in_flight = InFlightPaths::new();
        let mut local_newer: HashSet<String> = HashSet::new();

        self.emit_progress(PassStage::Snapshot, 0, "");
        let mut map = self.snapshot(ctx).await?;

        self.emit_progress(PassStage::UploadNew, 0, "");
        self.upload_walk(ctx, &mut map, &in_flight, &mut local_newer, &mut summary, false)
            .await?;

        self.emit_progress(PassStage::Download, 0, "");
        self.download_remote(ctx, &map, &mut local_newer, &mut summary)
            .await?;

        self.emit_progress(PassStage::UploadNewer, 0, "");
        self.upload_walk(ctx, &mut map, &in_flight, &mut local_newer, &mut summary, true)
            .await?;

        self.events.emit(SyncEvent::PassCompleted {
            uploads: summary.uploads,
            downloads: summary.downloads,
            folders_created: summary.folders_created,
            deferred: summary.deferred,
        });
        Ok(summary)
    }

    /// Cancellation and workspace drift are checked before every
    /// state-mutating step; a pass never acts on a workspace it was not
    /// started for.
    fn guard(&self, ctx: &WorkspaceContext) -> Result<(), ReconcileError> {
        if ctx.cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        if ctx.drifted() {
            return Err(ReconcileError::WorkspaceChanged);
        }
        Ok(())
    }

    fn emit_progress(&self, stage: PassStage, percentage: u8, current_path: &str) {
        self.events.emit(SyncEvent::PassProgress {
            stage,
            percentage,
            current_path: current_path.to_string(),
        });
    }
}

include!("reconcile_impl_phases.rs");

fn remote_is_newer(remote_ts: i64, local_ts: i64) -> bool {
    remote_ts - local_ts > TIMESTAMP_TOLERANCE_SECS
}

fn local_is_newer(local_ts: i64, remote_ts: i64) -> bool {
    local_ts - remote_ts > TIMESTAMP_TOLERANCE_SECS
}

fn mtime_unix(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn set_file_mtime(path: &Path, ts_unix: i64) -> std::io::Result<()> {
    let modified =
        std::time::UNIX_EPOCH + std::time::Duration::from_secs(ts_unix.max(0) as u64);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(std::fs::FileTimes::new().set_modified(modified))
}

#[cfg(test)]
#[path = "reconcile_tests/mod.rs"]
mod tests;
