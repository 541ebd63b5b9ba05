use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::model::{
    DirectoryState, MetadataRecord, RecordQuery, StatusFilter, TransferStatus,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RECORD_COLUMNS: &str = "oc_id, account, server_path, file_name, file_id, is_directory, status, etag, content_type, size, modified, favorite, offline, live_photo, provider, local_etag";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid transfer status: {0}")]
    InvalidStatus(String),
    #[error("invalid download selector: {0}")]
    InvalidSelector(String),
}

/// Persisted file/folder metadata.
///
/// `apply_delta` commits atomically: a concurrent `query` over the same folder
/// sees the records either before or after the whole delta.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn query(&self, query: &RecordQuery) -> Result<Vec<MetadataRecord>, StoreError>;

    async fn get_directory_state(
        &self,
        account: &str,
        server_path: &str,
    ) -> Result<Option<DirectoryState>, StoreError>;

    async fn get_record(
        &self,
        account: &str,
        server_path: &str,
        file_name: &str,
    ) -> Result<Option<MetadataRecord>, StoreError>;

    /// Upserts `updated` by `oc_id`, then removes `deleted`.
    async fn apply_delta(
        &self,
        updated: &[MetadataRecord],
        deleted: &[String],
    ) -> Result<(), StoreError>;

    async fn put_directory_state(&self, directory: &DirectoryState) -> Result<(), StoreError>;

    async fn set_status(&self, oc_id: &str, status: TransferStatus) -> Result<(), StoreError>;
}

/// What the downloaded file is wanted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadSelector {
    DownloadFile,
    OpenIn,
    Offline,
}

impl DownloadSelector {
    fn as_str(&self) -> &'static str {
        match self {
            DownloadSelector::DownloadFile => "download_file",
            DownloadSelector::OpenIn => "open_in",
            DownloadSelector::Offline => "offline",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "download_file" => Ok(DownloadSelector::DownloadFile),
            "open_in" => Ok(DownloadSelector::OpenIn),
            "offline" => Ok(DownloadSelector::Offline),
            other => Err(StoreError::InvalidSelector(other.to_string())),
        }
    }

    fn priority(&self) -> i32 {
        match self {
            DownloadSelector::OpenIn => 100,
            DownloadSelector::DownloadFile => 50,
            DownloadSelector::Offline => 10,
        }
    }
}

#[async_trait]
pub trait DownloadScheduler: Send + Sync {
    async fn request(
        &self,
        record: &MetadataRecord,
        selector: DownloadSelector,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDownload {
    pub oc_id: String,
    pub selector: DownloadSelector,
    pub attempt: u32,
    pub priority: i32,
}

pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
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

    /// Pops the most urgent queued download, if any.
    pub async fn dequeue_download(&self) -> Result<Option<QueuedDownload>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, oc_id, selector, attempt, priority
             FROM download_queue
             ORDER BY priority DESC, id ASC
             LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let selector: String = row.try_get("selector")?;
        let download = QueuedDownload {
            oc_id: row.try_get("oc_id")?,
            selector: DownloadSelector::parse(&selector)?,
            attempt: row.try_get("attempt")?,
            priority: row.try_get("priority")?,
        };

        sqlx::query("DELETE FROM download_queue WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(download))
    }

    pub async fn get_record_by_id(&self, oc_id: &str) -> Result<Option<MetadataRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM metadata WHERE oc_id = ?1"
        ))
        .bind(oc_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Marks a download finished: status back to normal and `etag` recorded
    /// as the version now on disk.
    pub async fn complete_download(&self, oc_id: &str, etag: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE metadata SET status = ?1, local_etag = ?2 WHERE oc_id = ?3")
            .bind(TransferStatus::Normal.as_str())
            .bind(etag)
            .bind(oc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for IndexStore {
    async fn query(&self, query: &RecordQuery) -> Result<Vec<MetadataRecord>, StoreError> {
        let rows = match query.status {
            StatusFilter::Any => {
                sqlx::query(&format!(
                    "SELECT {RECORD_COLUMNS} FROM metadata
                     WHERE account = ?1 AND server_path = ?2
                     ORDER BY oc_id ASC"
                ))
                .bind(&query.account)
                .bind(&query.server_path)
                .fetch_all(&self.pool)
                .await?
            }
            StatusFilter::NotNormal => {
                sqlx::query(&format!(
                    "SELECT {RECORD_COLUMNS} FROM metadata
                     WHERE account = ?1 AND server_path = ?2 AND status != ?3
                     ORDER BY oc_id ASC"
                ))
                .bind(&query.account)
                .bind(&query.server_path)
                .bind(TransferStatus::Normal.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(record_from_row).collect()
    }

    async fn get_directory_state(
        &self,
        account: &str,
        server_path: &str,
    ) -> Result<Option<DirectoryState>, StoreError> {
        let row = sqlx::query(
            "SELECT account, server_path, oc_id, etag, rich_workspace, favorite, offline
             FROM directories WHERE account = ?1 AND server_path = ?2",
        )
        .bind(account)
        .bind(server_path)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let favorite: i64 = row.try_get("favorite")?;
        let offline: i64 = row.try_get("offline")?;
        Ok(Some(DirectoryState {
            account: row.try_get("account")?,
            server_path: row.try_get("server_path")?,
            oc_id: row.try_get("oc_id")?,
            etag: row.try_get("etag")?,
            rich_workspace: row.try_get("rich_workspace")?,
            favorite: favorite != 0,
            offline: offline != 0,
        }))
    }

    async fn get_record(
        &self,
        account: &str,
        server_path: &str,
        file_name: &str,
    ) -> Result<Option<MetadataRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM metadata
             WHERE account = ?1 AND server_path = ?2 AND file_name = ?3
             LIMIT 1"
        ))
        .bind(account)
        .bind(server_path)
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn apply_delta(
        &self,
        updated: &[MetadataRecord],
        deleted: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Remote data never overwrites the local transfer status, offline flag
        // or downloaded-copy etag.
        for record in updated {
            sqlx::query(
                "INSERT INTO metadata (
                    oc_id, account, server_path, file_name, file_id, is_directory, status,
                    etag, content_type, size, modified, favorite, offline, live_photo, provider,
                    local_etag
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(oc_id) DO UPDATE SET
                    account = excluded.account,
                    server_path = excluded.server_path,
                    file_name = excluded.file_name,
                    file_id = excluded.file_id,
                    is_directory = excluded.is_directory,
                    etag = excluded.etag,
                    content_type = excluded.content_type,
                    size = excluded.size,
                    modified = excluded.modified,
                    favorite = excluded.favorite,
                    live_photo = excluded.live_photo,
                    provider = excluded.provider",
            )
            .bind(&record.oc_id)
            .bind(&record.account)
            .bind(&record.server_path)
            .bind(&record.file_name)
            .bind(&record.file_id)
            .bind(if record.is_directory { 1 } else { 0 })
            .bind(record.status.as_str())
            .bind(&record.etag)
            .bind(&record.content_type)
            .bind(record.size)
            .bind(record.modified)
            .bind(if record.favorite { 1 } else { 0 })
            .bind(if record.offline { 1 } else { 0 })
            .bind(if record.live_photo { 1 } else { 0 })
            .bind(&record.provider)
            .bind(&record.local_etag)
            .execute(&mut *tx)
            .await?;
        }

        for oc_id in deleted {
            sqlx::query("DELETE FROM metadata WHERE oc_id = ?1")
                .bind(oc_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM download_queue WHERE oc_id = ?1")
                .bind(oc_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn put_directory_state(&self, directory: &DirectoryState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO directories (account, server_path, oc_id, etag, rich_workspace, favorite, offline)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account, server_path) DO UPDATE SET
                oc_id = excluded.oc_id,
                etag = excluded.etag,
                rich_workspace = excluded.rich_workspace,
                favorite = excluded.favorite,
                offline = excluded.offline",
        )
        .bind(&directory.account)
        .bind(&directory.server_path)
        .bind(&directory.oc_id)
        .bind(&directory.etag)
        .bind(&directory.rich_workspace)
        .bind(if directory.favorite { 1 } else { 0 })
        .bind(if directory.offline { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, oc_id: &str, status: TransferStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE metadata SET status = ?1 WHERE oc_id = ?2")
            .bind(status.as_str())
            .bind(oc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DownloadScheduler for IndexStore {
    async fn request(
        &self,
        record: &MetadataRecord,
        selector: DownloadSelector,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO download_queue (oc_id, selector, attempt, priority) VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(oc_id) DO UPDATE SET
                selector = excluded.selector,
                priority = MAX(download_queue.priority, excluded.priority)",
        )
        .bind(&record.oc_id)
        .bind(selector.as_str())
        .bind(selector.priority())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE metadata SET status = ?1 WHERE oc_id = ?2")
            .bind(TransferStatus::WaitDownload.as_str())
            .bind(&record.oc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<MetadataRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let is_directory: i64 = row.try_get("is_directory")?;
    let favorite: i64 = row.try_get("favorite")?;
    let offline: i64 = row.try_get("offline")?;
    let live_photo: i64 = row.try_get("live_photo")?;
    Ok(MetadataRecord {
        oc_id: row.try_get("oc_id")?,
        account: row.try_get("account")?,
        server_path: row.try_get("server_path")?,
        file_name: row.try_get("file_name")?,
        file_id: row.try_get("file_id")?,
        is_directory: is_directory != 0,
        status: TransferStatus::parse(&status).ok_or(StoreError::InvalidStatus(status))?,
        etag: row.try_get("etag")?,
        content_type: row.try_get("content_type")?,
        size: row.try_get("size")?,
        modified: row.try_get("modified")?,
        favorite: favorite != 0,
        offline: offline != 0,
        live_photo: live_photo != 0,
        provider: row.try_get("provider")?,
        local_etag: row.try_get("local_etag")?,
    })
}

/// `$XDG_DATA_HOME/folderview/index.db` or the platform equivalent.
pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("folderview");
    path.push("index.db");
    Ok(path)
}

/// Single-connection in-memory store; every connection of a `sqlite::memory:`
/// pool would otherwise see its own empty database.
#[cfg(test)]
pub(crate) async fn memory_store() -> IndexStore {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
