pub mod backoff;
pub mod context;
pub mod coordinator;
pub mod debounce;
pub mod echo;
pub mod guard;
pub mod handlers;
pub mod paths;
pub mod pipeline;
pub mod reconcile;
pub mod store;
pub mod tree;
pub mod watcher;

use std::path::Path;

use cirrus_core::{EntryKind, RemoteEntry};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use store::{LocalRecord, RecordKind};

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn parse_updated_at(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}

/// Builds the store row for a remote entry that now lives at `local_path`.
pub(crate) fn record_for(
    entry: &RemoteEntry,
    local_path: &Path,
) -> Result<LocalRecord, time::error::Parse> {
    Ok(LocalRecord {
        id: entry.id,
        workspace_id: entry.workspace_id,
        name: entry.name.clone(),
        kind: match entry.kind {
            EntryKind::File => RecordKind::File,
            EntryKind::Folder => RecordKind::Folder,
        },
        parent_id: entry.parent_id,
        size: entry.size.map(|v| v as i64),
        hash: entry.hash.clone(),
        updated_at: parse_updated_at(entry.updated_at.as_deref())?,
        local_path: local_path.to_string_lossy().into_owned(),
        last_synced_at: Some(now_unix()),
    })
}
