use std::{fs, path::PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("platform data directory is unavailable")]
    MissingDataDir,
    #[error("invalid record kind: {0}")]
    InvalidKind(String),
    #[error("record not found after upsert")]
    MissingRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    File,
    Folder,
}

impl RecordKind {
    fn as_str(&self) -> &'static str {
        match self {
            RecordKind::File => "file",
            RecordKind::Folder => "folder",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "file" => Ok(RecordKind::File),
            "folder" => Ok(RecordKind::Folder),
            other => Err(StoreError::InvalidKind(other.to_string())),
        }
    }
}

/// One synchronized entry: the remote identity plus where it lives locally.
/// `id` is the remote-assigned identifier and the primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRecord {
    pub id: i64,
    pub workspace_id: i64,
    pub name: String,
    pub kind: RecordKind,
    pub parent_id: Option<i64>,
    pub size: Option<i64>,
    pub hash: Option<String>,
    pub updated_at: Option<i64>,
    pub local_path: String,
    pub last_synced_at: Option<i64>,
}

pub struct MetadataStore {
    pool: SqlitePool,
}

include!("store_impl.rs");

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("cirrusd");
    path.push("sync");
    path.push("metadata.db");
    Ok(path)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
