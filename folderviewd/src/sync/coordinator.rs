//! Reconciliation between the metadata store, the remote listing and the
//! render loop for a single folder view.
//!
//! Two entry points do the work:
//!
//! - [`SyncCoordinator::reload_local`] rebuilds the projection from the store,
//!   unless the cached one is still trustworthy (same directory etag, nothing
//!   in transfer, no highlight waiting).
//! - [`SyncCoordinator::reload_network`] fetches the remote listing, applies
//!   the delta, queues downloads and rebuilds when something changed. Only one
//!   runs at a time; overlapping calls collapse into a single follow-up.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::highlight::HighlightScheduler;
use super::model::{DirectoryState, MetadataRecord, RecordQuery, SessionContext};
use super::projection::{DataSource, DisplayConfig, rebuild};
use super::remote::{FolderListing, ListError, NetworkClient};
use super::render::{RenderCommand, RenderHandle};
use super::slot::{ReloadSlot, SlotGuard};
use super::store::{DownloadScheduler, DownloadSelector, MetadataStore, StoreError};

/// How a rebuild is announced to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Keep showing the previous snapshot until the new one is ready.
    #[default]
    StaleThenFresh,
    /// Send [`RenderCommand::Rebuilding`] before every rebuild.
    Rebuilding,
}

/// Which listed files get queued for download after a network reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPolicy {
    /// Files marked offline, or inside a folder marked offline.
    #[default]
    OfflineOnly,
    AllFiles,
    Disabled,
}

impl DownloadPolicy {
    pub fn admits(&self, record: &MetadataRecord, directory: &DirectoryState) -> bool {
        match self {
            DownloadPolicy::OfflineOnly => record.offline || directory.offline,
            DownloadPolicy::AllFiles => true,
            DownloadPolicy::Disabled => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub highlight_delay: Duration,
    pub pulse_duration: Duration,
    pub publish_mode: PublishMode,
    pub download_policy: DownloadPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            highlight_delay: Duration::from_millis(300),
            pulse_duration: Duration::from_secs(2),
            publish_mode: PublishMode::default(),
            download_policy: DownloadPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("metadata store error: {0}")]
    Store(#[from] StoreError),
    #[error("network listing failed ({code}): {description}")]
    Network { code: i32, description: String },
    #[error("projection task failed: {0}")]
    Projection(#[from] tokio::task::JoinError),
}

impl From<ListError> for SyncError {
    fn from(err: ListError) -> Self {
        SyncError::Network {
            code: err.code,
            description: err.description,
        }
    }
}

/// Outcome of the last network run performed by one `reload_network` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub updated: usize,
    pub deleted: usize,
    pub downloads_requested: usize,
    pub rebuilt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkReload {
    Completed(ReloadReport),
    /// Another run was in flight; this request was folded into its follow-up.
    Coalesced,
    /// The view is showing search results, which are listed elsewhere.
    DelegatedToSearch,
}

pub struct SyncCoordinator {
    session: RwLock<SessionContext>,
    display: RwLock<DisplayConfig>,
    config: CoordinatorConfig,
    store: Arc<dyn MetadataStore>,
    network: Arc<dyn NetworkClient>,
    downloads: Arc<dyn DownloadScheduler>,
    render: RenderHandle,
    current: RwLock<Arc<DataSource>>,
    rebuild_lock: Mutex<()>,
    slot: ReloadSlot,
    highlight: HighlightScheduler,
}

impl SyncCoordinator {
    pub fn new(
        session: SessionContext,
        config: CoordinatorConfig,
        store: Arc<dyn MetadataStore>,
        network: Arc<dyn NetworkClient>,
        downloads: Arc<dyn DownloadScheduler>,
        render: RenderHandle,
    ) -> Self {
        let highlight =
            HighlightScheduler::new(render.clone(), config.highlight_delay, config.pulse_duration);
        Self {
            session: RwLock::new(session),
            display: RwLock::new(DisplayConfig::default()),
            config,
            store,
            network,
            downloads,
            render,
            current: RwLock::new(Arc::new(DataSource::default())),
            rebuild_lock: Mutex::new(()),
            slot: ReloadSlot::new(),
            highlight,
        }
    }

    pub fn with_display_config(self, display: DisplayConfig) -> Self {
        self.set_display_config(display);
        self
    }

    pub fn session(&self) -> SessionContext {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn display_config(&self) -> DisplayConfig {
        self.display
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the display config. Takes effect on the next rebuild.
    pub fn set_display_config(&self, display: DisplayConfig) {
        *self.display.write().unwrap_or_else(PoisonError::into_inner) = display;
    }

    pub fn data_source(&self) -> Arc<DataSource> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_network_reload_in_progress(&self) -> bool {
        self.slot.is_running()
    }

    pub fn pending_highlight(&self) -> Option<String> {
        self.highlight.pending()
    }

    /// Rebuilds the projection from the store unless the current one can be
    /// trusted. A trusted cache returns the current `Arc` itself.
    pub async fn reload_local(&self, forced: bool) -> Result<Arc<DataSource>, SyncError> {
        let session = self.session();
        if !session.is_active() {
            return Ok(self.data_source());
        }

        let _rebuild = self.rebuild_lock.lock().await;
        self.rebuild_local(&session, forced).await.inspect_err(|err| {
            warn!(path = %session.server_path, error = %err, "local reload failed");
        })
    }

    async fn rebuild_local(
        &self,
        session: &SessionContext,
        forced: bool,
    ) -> Result<Arc<DataSource>, SyncError> {
        let directory = self
            .store
            .get_directory_state(&session.account, &session.server_path)
            .await?;
        let previous = self.data_source();
        if !forced && self.cache_trusted(session, directory.as_ref(), &previous).await? {
            debug!(path = %session.server_path, "cache trusted, skipping rebuild");
            return Ok(previous);
        }

        let records = self
            .store
            .query(&RecordQuery::all(&session.account, &session.server_path))
            .await?;
        if self.config.publish_mode == PublishMode::Rebuilding {
            self.render.send(RenderCommand::Rebuilding);
        }
        let display = self.display_config();
        let source = tokio::task::spawn_blocking(move || {
            rebuild(&records, directory.as_ref(), &display)
        })
        .await?;
        let source = Arc::new(source);

        {
            // `set_path` resets `current` after switching the path, so holding
            // the write lock across the check keeps a stale folder out.
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if self.session().server_path != session.server_path {
                debug!(path = %session.server_path, "path changed during rebuild, discarding");
                return Ok(Arc::clone(&current));
            }
            *current = Arc::clone(&source);
            self.render.publish(Arc::clone(&source));
        }
        debug!(path = %session.server_path, records = source.len(), "projection rebuilt");

        if let Some(target) = self.highlight.awaiting_schedule()
            && !source.is_empty()
        {
            match source.position_of_name(&target) {
                Some(position) => self.highlight.schedule(&target, position),
                None => self.highlight.clear(),
            }
        }

        Ok(source)
    }

    async fn cache_trusted(
        &self,
        session: &SessionContext,
        directory: Option<&DirectoryState>,
        previous: &DataSource,
    ) -> Result<bool, SyncError> {
        let Some(fresh) = directory.and_then(|d| d.etag.as_deref()) else {
            return Ok(false);
        };
        if previous.etag() != Some(fresh) || self.highlight.pending().is_some() {
            return Ok(false);
        }
        let in_transfer = self
            .store
            .query(&RecordQuery::in_transfer(
                &session.account,
                &session.server_path,
            ))
            .await?;
        Ok(in_transfer.is_empty())
    }

    /// Fetches the remote listing and applies it. Never retries internally;
    /// an error drops any coalesced follow-up.
    pub async fn reload_network(&self, forced: bool) -> Result<NetworkReload, SyncError> {
        if self.display_config().is_searching() {
            return Ok(NetworkReload::DelegatedToSearch);
        }
        if !self.session().is_active() {
            return Ok(NetworkReload::Completed(ReloadReport::default()));
        }
        let Some(mut guard) = self.slot.try_acquire(forced) else {
            debug!(forced, "network reload in flight, coalescing");
            return Ok(NetworkReload::Coalesced);
        };

        self.render.send(RenderCommand::NetworkActivity(true));
        let result = self.run_network_reloads(&mut guard, forced).await;
        drop(guard);
        self.render.send(RenderCommand::NetworkActivity(false));

        match result {
            Ok(report) => Ok(NetworkReload::Completed(report)),
            Err(err) => {
                warn!(error = %err, "network reload failed");
                Err(err)
            }
        }
    }

    async fn run_network_reloads(
        &self,
        guard: &mut SlotGuard<'_>,
        mut forced: bool,
    ) -> Result<ReloadReport, SyncError> {
        loop {
            let report = self.fetch_and_apply(forced).await?;
            match guard.take_follow_up() {
                Some(next) => forced = next,
                None => return Ok(report),
            }
        }
    }

    async fn fetch_and_apply(&self, forced: bool) -> Result<ReloadReport, SyncError> {
        let session = self.session();
        let listing = self.network.list(&session.server_path, forced).await?;

        // Delta before token: an interrupted apply leaves a stale etag behind.
        self.store
            .apply_delta(&listing.updated, &listing.deleted)
            .await?;
        self.store.put_directory_state(&listing.directory).await?;
        let downloads_requested = self.request_downloads(&listing).await;

        let mut report = ReloadReport {
            updated: listing.updated.len(),
            deleted: listing.deleted.len(),
            downloads_requested,
            rebuilt: false,
        };
        info!(
            path = %session.server_path,
            updated = report.updated,
            deleted = report.deleted,
            downloads = report.downloads_requested,
            "network reload applied"
        );

        if report.updated > 0 || report.deleted > 0 || forced {
            self.reload_local(true).await?;
            report.rebuilt = true;
        } else {
            let current = self.data_source();
            if current.is_empty() {
                self.render.publish(current);
            }
        }
        Ok(report)
    }

    async fn request_downloads(&self, listing: &FolderListing) -> usize {
        let mut requested = 0;
        for record in listing.metadatas.iter().filter(|r| !r.is_directory) {
            if !self
                .config
                .download_policy
                .admits(record, &listing.directory)
            {
                continue;
            }
            let stored = match self
                .store
                .get_record(&record.account, &record.server_path, &record.file_name)
                .await
            {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(oc_id = %record.oc_id, error = %err, "could not read record status");
                    continue;
                }
            };
            let stored = stored.as_ref().unwrap_or(record);
            if stored.status.is_download_pending() || stored.has_current_copy() {
                continue;
            }
            match self
                .downloads
                .request(record, DownloadSelector::DownloadFile)
                .await
            {
                Ok(()) => requested += 1,
                Err(err) => {
                    warn!(oc_id = %record.oc_id, error = %err, "download request failed")
                }
            }
        }
        requested
    }

    /// Scrolls to and pulses `file_name` after the highlight delay. Returns
    /// `false` without scheduling anything when the name is not listed.
    ///
    /// Callable from any thread once the coordinator was built inside a Tokio
    /// runtime; the delayed task runs on that runtime.
    pub fn highlight_and_scroll(&self, file_name: &str) -> bool {
        match self.data_source().position_of_name(file_name) {
            Some(position) => {
                self.highlight.schedule(file_name, position);
                true
            }
            None => false,
        }
    }

    /// Remembers `file_name` so the next rebuild highlights it.
    pub fn set_pending_highlight(&self, file_name: impl Into<String>) {
        self.highlight.set_pending(file_name);
    }

    pub async fn on_appear(&self) -> Result<Arc<DataSource>, SyncError> {
        self.reload_local(false).await
    }

    pub fn on_disappear(&self) {
        self.highlight.clear();
    }

    /// `at_start` notifications announce work that has not happened yet and
    /// are ignored.
    pub async fn on_external_notification(
        &self,
        at_start: bool,
    ) -> Result<Option<NetworkReload>, SyncError> {
        if at_start {
            return Ok(None);
        }
        self.reload_local(false).await?;
        self.reload_network(false).await.map(Some)
    }

    pub fn set_path(&self, server_path: impl Into<String>) {
        self.highlight.clear();
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .server_path = server_path.into();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(DataSource::default());
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
