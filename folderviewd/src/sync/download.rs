//! Drains the persisted download queue into a local cache directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use folderview_core::{ListingClient, ListingError};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::model::{MetadataRecord, TransferStatus};
use super::store::{IndexStore, MetadataStore, StoreError};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download request failed: {0}")]
    Fetch(#[from] ListingError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path escapes the cache directory: {0}")]
    UnsafePath(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { oc_id: String, path: PathBuf },
    /// The record is marked `DownloadError`; the next listing queues it again.
    Failed { oc_id: String },
    /// The record was deleted after it was queued.
    Skipped { oc_id: String },
}

pub struct DownloadWorker {
    client: ListingClient,
    store: Arc<IndexStore>,
    cache_root: PathBuf,
}

impl DownloadWorker {
    pub fn new(client: ListingClient, store: Arc<IndexStore>, cache_root: PathBuf) -> Self {
        Self {
            client,
            store,
            cache_root,
        }
    }

    /// `<cache_root>/<account>/<folder path>/<file name>`.
    pub fn local_path(&self, record: &MetadataRecord) -> Result<PathBuf, DownloadError> {
        let mut path = self.cache_root.clone();
        push_segment(&mut path, &record.account)?;
        for component in Path::new(record.server_path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(segment) => path.push(segment),
                Component::CurDir => {}
                _ => return Err(DownloadError::UnsafePath(record.server_path.clone())),
            }
        }
        push_segment(&mut path, &record.file_name)?;
        Ok(path)
    }

    /// Processes one queued download. `None` when the queue is empty; only
    /// store failures are errors, a failed transfer is an outcome.
    pub async fn run_once(&self) -> Result<Option<DownloadOutcome>, StoreError> {
        let Some(queued) = self.store.dequeue_download().await? else {
            return Ok(None);
        };
        let Some(record) = self.store.get_record_by_id(&queued.oc_id).await? else {
            debug!(oc_id = %queued.oc_id, "queued record is gone");
            return Ok(Some(DownloadOutcome::Skipped {
                oc_id: queued.oc_id,
            }));
        };

        self.store
            .set_status(&record.oc_id, TransferStatus::Downloading)
            .await?;
        match self.download(&record).await {
            Ok((path, etag)) => {
                self.store.complete_download(&record.oc_id, &etag).await?;
                info!(oc_id = %record.oc_id, path = %path.display(), "download finished");
                Ok(Some(DownloadOutcome::Completed {
                    oc_id: record.oc_id,
                    path,
                }))
            }
            Err(err) => {
                warn!(oc_id = %record.oc_id, error = %err, "download failed");
                self.store
                    .set_status(&record.oc_id, TransferStatus::DownloadError)
                    .await?;
                Ok(Some(DownloadOutcome::Failed {
                    oc_id: record.oc_id,
                }))
            }
        }
    }

    /// Runs until the queue is empty and returns how many entries it handled.
    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut handled = 0;
        while self.run_once().await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    async fn download(&self, record: &MetadataRecord) -> Result<(PathBuf, String), DownloadError> {
        let target = self.local_path(record)?;
        let content = self.client.fetch_file(&remote_path(record)).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut partial = target.clone().into_os_string();
        partial.push(".part");
        tokio::fs::write(&partial, &content.bytes).await?;
        tokio::fs::rename(&partial, &target).await?;
        let etag = content.etag.unwrap_or_else(|| record.etag.clone());
        Ok((target, etag))
    }
}

fn push_segment(path: &mut PathBuf, segment: &str) -> Result<(), DownloadError> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
        return Err(DownloadError::UnsafePath(segment.to_string()));
    }
    path.push(segment);
    Ok(())
}

fn remote_path(record: &MetadataRecord) -> String {
    if record.server_path.ends_with('/') {
        format!("{}{}", record.server_path, record.file_name)
    } else {
        format!("{}/{}", record.server_path, record.file_name)
    }
}
