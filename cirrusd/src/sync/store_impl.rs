impl MetadataStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get_all(&self, workspace_id: i64) -> Result<Vec<LocalRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, name, kind, parent_id, size, hash, updated_at, local_path, last_synced_at
             FROM entries
             WHERE workspace_id = ?1
             ORDER BY local_path ASC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<LocalRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, workspace_id, name, kind, parent_id, size, hash, updated_at, local_path, last_synced_at
             FROM entries WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn get_by_path(&self, local_path: &str) -> Result<Option<LocalRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, workspace_id, name, kind, parent_id, size, hash, updated_at, local_path, last_synced_at
             FROM entries WHERE local_path = ?1",
        )
        .bind(local_path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Looks up a record by its `(name, parent_id, size)` identity within a
    /// workspace. A hit means "same entity": two paths resolving here are
    /// merged rather than uploaded twice. Name comparison is
    /// case-insensitive.
    pub async fn find(
        &self,
        workspace_id: i64,
        name: &str,
        parent_id: Option<i64>,
        size: i64,
    ) -> Result<Option<LocalRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, workspace_id, name, kind, parent_id, size, hash, updated_at, local_path, last_synced_at
             FROM entries
             WHERE workspace_id = ?1
               AND name = ?2 COLLATE NOCASE
               AND parent_id IS ?3
               AND size = ?4
             LIMIT 1",
        )
        .bind(workspace_id)
        .bind(name)
        .bind(parent_id)
        .bind(size)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn upsert(&self, record: &LocalRecord) -> Result<LocalRecord, StoreError> {
        upsert_in(&self.pool, record).await?;
        self.get_by_id(record.id)
            .await?
            .ok_or(StoreError::MissingRecord)
    }

    /// Atomic batch upsert: either every record lands or none does.
    pub async fn upsert_batch(&self, records: &[LocalRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            upsert_in(&mut *tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Missing rows are non-fatal; deleting an already-gone record is a
    /// no-op.
    pub async fn delete(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM entries WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_path(&self, local_path: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM entries WHERE local_path = ?1")
            .bind(local_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn upsert_in<'e, E>(executor: E, record: &LocalRecord) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO entries (
            id, workspace_id, name, kind, parent_id, size, hash, updated_at, local_path, last_synced_at
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            workspace_id = excluded.workspace_id,
            name = excluded.name,
            kind = excluded.kind,
            parent_id = excluded.parent_id,
            size = excluded.size,
            hash = excluded.hash,
            updated_at = excluded.updated_at,
            local_path = excluded.local_path,
            last_synced_at = excluded.last_synced_at;",
    )
    .bind(record.id)
    .bind(record.workspace_id)
    .bind(&record.name)
    .bind(record.kind.as_str())
    .bind(record.parent_id)
    .bind(record.size)
    .bind(&record.hash)
    .bind(record.updated_at)
    .bind(&record.local_path)
    .bind(record.last_synced_at)
    .execute(executor)
    .await?;
    Ok(())
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LocalRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(LocalRecord {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        name: row.try_get("name")?,
        kind: RecordKind::parse(&kind)?,
        parent_id: row.try_get("parent_id")?,
        size: row.try_get("size")?,
        hash: row.try_get("hash")?,
        updated_at: row.try_get("updated_at")?,
        local_path: row.try_get("local_path")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}
