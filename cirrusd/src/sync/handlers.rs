use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cirrus_core::{CirrusClient, CirrusError};
use thiserror::Error;

use super::context::WorkspaceContext;
use super::echo::EchoSuppressor;
use super::pipeline::{PipelineError, TransferPipeline};
use super::record_for;
use super::store::{MetadataStore, RecordKind, StoreError};
use super::watcher::WatcherEvent;
use crate::events::{EventBus, FsChangeKind, SyncEvent};

// How long a folder-create handler waits for its parent's own creation to
// settle before deferring.
const PARENT_RESOLVE_ATTEMPTS: u32 = 10;
const PARENT_RESOLVE_DELAY: Duration = Duration::from_millis(1500);

// A modify event whose size matches and whose mtime is within this band of
// the stored timestamp is the same content and is skipped.
const MODIFY_SKIP_BAND_SECS: i64 = 5;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("api error: {0}")]
    Api(#[from] CirrusError),
    #[error("transfer error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("parent folder is not yet known for {0}")]
    UnresolvedParent(String),
    #[error("path is outside the sync root: {0}")]
    OutsideRoot(String),
    #[error("workspace changed")]
    WorkspaceChanged,
}

/// Single-file handlers behind the watcher. Each call owns exactly one path
/// (the watcher's per-path guard) and re-checks the workspace before any
/// remote mutation.
pub struct EventHandlers {
    pub client: CirrusClient,
    pub store: Arc<MetadataStore>,
    pub pipeline: Arc<TransferPipeline>,
    pub echo: Arc<EchoSuppressor>,
    pub events: Arc<EventBus>,
    pub ctx: WorkspaceContext,
    pub sync_root: PathBuf,
}

impl EventHandlers {
    pub async fn handle(&self, event: WatcherEvent) -> Result<(), HandlerError> {
        match event {
            WatcherEvent::CreatedFile(path) => self.on_created_file(&path).await,
            WatcherEvent::CreatedFolder(path) => self.on_created_folder(&path).await,
            WatcherEvent::Modified(path) => self.on_modified(&path).await,
            WatcherEvent::Removed(path) => self.on_removed(&path).await,
            WatcherEvent::Renamed { from, to } => self.on_renamed(&from, &to).await,
        }
    }

    pub async fn on_created_file(&self, path: &Path) -> Result<(), HandlerError> {
        self.ensure_workspace()?;
        let path_str = path.to_string_lossy();
        if self.store.get_by_path(&path_str).await?.is_some() {
            return Ok(());
        }

        let meta = tokio::fs::metadata(path).await?;
        let size = meta.len();
        let name = file_name_of(path);
        let parent_id = self.resolve_parent_id(path).await?;

        // Same (name, parent, size) identity: the entry already exists
        // remotely under another local spelling. Merge instead of uploading.
        if let Some(existing) = self
            .store
            .find(self.ctx.workspace_id(), &name, parent_id, size as i64)
            .await?
        {
            let mut merged = existing;
            merged.local_path = path_str.into_owned();
            self.store.upsert(&merged).await?;
            return Ok(());
        }

        self.ensure_workspace()?;
        let entry = self
            .pipeline
            .upload(self.ctx.workspace_id(), path, parent_id)
            .await?;
        self.store.upsert(&record_for(&entry, path)?).await?;
        self.echo.mark(path);
        self.events.emit(SyncEvent::FsChange {
            change: FsChangeKind::Added,
            path: path.display().to_string(),
            old_path: None,
        });
        Ok(())
    }

    pub async fn on_created_folder(&self, path: &Path) -> Result<(), HandlerError> {
        self.ensure_workspace()?;
        if self.store.get_by_path(&path.to_string_lossy()).await?.is_some() {
            return Ok(());
        }

        let parent_id = self.resolve_parent_id_with_retry(path).await?;
        let name = file_name_of(path);

        self.ensure_workspace()?;
        let entry = self
            .client
            .create_folder(self.ctx.workspace_id(), &name, parent_id)
            .await?;
        self.store.upsert(&record_for(&entry, path)?).await?;
        self.events.emit(SyncEvent::FsChange {
            change: FsChangeKind::Added,
            path: path.display().to_string(),
            old_path: None,
        });
        Ok(())
    }

    pub async fn on_modified(&self, path: &Path) -> Result<(), HandlerError> {
        self.ensure_workspace()?;
        let Some(record) = self.store.get_by_path(&path.to_string_lossy()).await? else {
            // First sight of this path; treat as a create.
            return self.on_created_file(path).await;
        };
        if record.kind == RecordKind::Folder {
            return Ok(());
        }

        let meta = tokio::fs::metadata(path).await?;
        let size = meta.len() as i64;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let known = record.updated_at.or(record.last_synced_at).unwrap_or(0);
        if record.size == Some(size) && (mtime - known).abs() <= MODIFY_SKIP_BAND_SECS {
            return Ok(());
        }

        // Re-upload under the same parent; the remote assigns a fresh id.
        self.ensure_workspace()?;
        self.client.delete(self.ctx.workspace_id(), record.id).await?;
        let entry = self
            .pipeline
            .upload(self.ctx.workspace_id(), path, record.parent_id)
            .await?;
        self.store.delete(record.id).await?;
        self.store.upsert(&record_for(&entry, path)?).await?;
        self.events.emit(SyncEvent::FsChange {
            change: FsChangeKind::Changed,
            path: path.display().to_string(),
            old_path: None,
        });
        Ok(())
    }

    pub async fn on_removed(&self, path: &Path) -> Result<(), HandlerError> {
        self.ensure_workspace()?;
        let path_str = path.to_string_lossy();
        let Some(record) = self.store.get_by_path(&path_str).await? else {
            return Ok(());
        };

        self.client.delete(self.ctx.workspace_id(), record.id).await?;
        self.store.delete(record.id).await?;
        self.events.emit(SyncEvent::FsChange {
            change: FsChangeKind::Removed,
            path: path.display().to_string(),
            old_path: None,
        });
        Ok(())
    }

    pub async fn on_renamed(&self, from: &Path, to: &Path) -> Result<(), HandlerError> {
        self.ensure_workspace()?;
        let meta = tokio::fs::metadata(to).await?;
        if meta.is_dir() {
            return self.refuse_folder_rename(from, to).await;
        }

        let Some(record) = self.store.get_by_path(&from.to_string_lossy()).await? else {
            // Unknown source path: the new name is effectively a new file.
            return self.on_created_file(to).await;
        };

        let new_name = file_name_of(to);
        self.client
            .rename(self.ctx.workspace_id(), record.id, &new_name)
            .await?;
        let mut renamed = record;
        renamed.name = new_name;
        renamed.local_path = to.to_string_lossy().into_owned();
        self.store.upsert(&renamed).await?;
        self.events.emit(SyncEvent::FsChange {
            change: FsChangeKind::Renamed,
            path: to.display().to_string(),
            old_path: Some(from.display().to_string()),
        });
        Ok(())
    }

    /// Folder renames are not propagated: folders anchor the path-to-id
    /// mapping, and renaming one would require re-keying the whole subtree.
    /// The rename is reverted on disk and the user notified.
    async fn refuse_folder_rename(&self, from: &Path, to: &Path) -> Result<(), HandlerError> {
        // Suppress the events our own revert is about to generate.
        self.echo.mark(from);
        self.echo.mark(to);
        let restored = tokio::fs::rename(to, from).await.is_ok();
        let message = if restored {
            format!(
                "folder renames are not synchronized; \"{}\" was restored to \"{}\"",
                to.display(),
                from.display()
            )
        } else {
            format!(
                "folder renames are not synchronized; please restore \"{}\" to \"{}\"",
                to.display(),
                from.display()
            )
        };
        self.events.error(message);
        Ok(())
    }

    /// Parent folder id from the metadata store, or None at the sync root.
    /// Unknown parents defer the operation; files are never parked at root.
    async fn resolve_parent_id(&self, path: &Path) -> Result<Option<i64>, HandlerError> {
        let Some(parent_dir) = path.parent() else {
            return Ok(None);
        };
        if parent_dir == self.sync_root {
            return Ok(None);
        }
        if !parent_dir.starts_with(&self.sync_root) {
            return Err(HandlerError::OutsideRoot(path.display().to_string()));
        }
        match self.store.get_by_path(&parent_dir.to_string_lossy()).await? {
            Some(record) if record.kind == RecordKind::Folder => Ok(Some(record.id)),
            _ => Err(HandlerError::UnresolvedParent(path.display().to_string())),
        }
    }

    /// Folder creations can race their parent's creation; wait for it to
    /// settle before deferring.
    async fn resolve_parent_id_with_retry(
        &self,
        path: &Path,
    ) -> Result<Option<i64>, HandlerError> {
        for _ in 0..PARENT_RESOLVE_ATTEMPTS {
            match self.resolve_parent_id(path).await {
                Err(HandlerError::UnresolvedParent(_)) => {
                    tokio::time::sleep(PARENT_RESOLVE_DELAY).await;
                }
                other => return other,
            }
        }
        self.resolve_parent_id(path).await
    }

    fn ensure_workspace(&self) -> Result<(), HandlerError> {
        if self.ctx.drifted() {
            return Err(HandlerError::WorkspaceChanged);
        }
        Ok(())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "handlers_tests.rs"]
mod tests;
