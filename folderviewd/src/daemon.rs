use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use folderview_core::ListingClient;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sync::coordinator::{
    CoordinatorConfig, DownloadPolicy, NetworkReload, PublishMode, SyncCoordinator,
};
use crate::sync::download::DownloadWorker;
use crate::sync::model::SessionContext;
use crate::sync::projection::{DataSource, DisplayConfig, SortKey};
use crate::sync::remote::FolderReader;
use crate::sync::render::{RenderTarget, spawn_render_loop};
use crate::sync::store::{IndexStore, default_db_path};

const DEFAULT_ACCOUNT: &str = "default";
const DEFAULT_SERVER_PATH: &str = "/";
const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_HIGHLIGHT_DELAY_MS: u64 = 300;
const DEFAULT_PULSE_MS: u64 = 2000;
const DEFAULT_DOWNLOAD_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub base_url: String,
    pub account: String,
    pub token: String,
    pub server_path: String,
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    pub poll_interval: Duration,
    pub download_interval: Duration,
    pub coordinator: CoordinatorConfig,
    pub display: DisplayConfig,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&|name: &str| std::env::var(name).ok())
    }

    pub fn from_lookup(env: EnvLookup<'_>) -> anyhow::Result<Self> {
        let base_url = read_required_env(env, "FOLDERVIEW_BASE_URL")?;
        let token = read_required_env(env, "FOLDERVIEW_TOKEN")?;
        let account =
            read_string_env(env, "FOLDERVIEW_ACCOUNT").unwrap_or_else(|| DEFAULT_ACCOUNT.into());
        let server_path = read_string_env(env, "FOLDERVIEW_PATH")
            .unwrap_or_else(|| DEFAULT_SERVER_PATH.into());
        let db_path = match read_string_env(env, "FOLDERVIEW_DB") {
            Some(value) => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            None => default_db_path().context("failed to resolve default database path")?,
        };
        let cache_dir = match read_string_env(env, "FOLDERVIEW_CACHE_DIR") {
            Some(value) => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            None => dirs::cache_dir()
                .context("cache directory is unavailable")?
                .join("folderview"),
        };
        let poll_interval = Duration::from_secs(read_u64_env(
            env,
            "FOLDERVIEW_POLL_SECS",
            DEFAULT_POLL_SECS,
        ));
        let download_interval = Duration::from_millis(read_u64_env(
            env,
            "FOLDERVIEW_DOWNLOAD_INTERVAL_MS",
            DEFAULT_DOWNLOAD_INTERVAL_MS,
        ));

        let coordinator = CoordinatorConfig {
            highlight_delay: Duration::from_millis(read_u64_env(
                env,
                "FOLDERVIEW_HIGHLIGHT_DELAY_MS",
                DEFAULT_HIGHLIGHT_DELAY_MS,
            )),
            pulse_duration: Duration::from_millis(read_u64_env(
                env,
                "FOLDERVIEW_PULSE_MS",
                DEFAULT_PULSE_MS,
            )),
            publish_mode: read_string_env(env, "FOLDERVIEW_PUBLISH_MODE")
                .map(|value| parse_publish_mode(&value))
                .transpose()?
                .unwrap_or_default(),
            download_policy: read_string_env(env, "FOLDERVIEW_DOWNLOAD_POLICY")
                .map(|value| parse_download_policy(&value))
                .transpose()?
                .unwrap_or_default(),
        };

        let defaults = DisplayConfig::default();
        let display = DisplayConfig {
            sort: read_string_env(env, "FOLDERVIEW_SORT")
                .map(|value| parse_sort_key(&value))
                .transpose()?
                .unwrap_or(defaults.sort),
            ascending: read_bool_env(env, "FOLDERVIEW_ASCENDING", defaults.ascending),
            directory_on_top: read_bool_env(
                env,
                "FOLDERVIEW_DIRECTORY_ON_TOP",
                defaults.directory_on_top,
            ),
            ..defaults
        };

        Ok(Self {
            base_url,
            account,
            token,
            server_path,
            db_path,
            cache_dir,
            poll_interval,
            download_interval,
            coordinator,
            display,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    coordinator: Arc<SyncCoordinator>,
    downloads: Arc<DownloadWorker>,
    render_task: JoinHandle<LogRenderTarget>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = Arc::new(
            IndexStore::open(&config.db_path)
                .await
                .with_context(|| format!("failed to open index at {:?}", config.db_path))?,
        );
        let client = ListingClient::new(&config.base_url, config.token.clone())
            .context("invalid FOLDERVIEW_BASE_URL")?;
        let downloads = Arc::new(DownloadWorker::new(
            client.clone(),
            store.clone(),
            config.cache_dir.clone(),
        ));
        let network = Arc::new(FolderReader::new(
            client,
            store.clone(),
            config.account.clone(),
        ));
        let (render, render_task) = spawn_render_loop(LogRenderTarget::default());

        let session = SessionContext::new(
            config.account.clone(),
            config.base_url.clone(),
            config.server_path.clone(),
        );
        let coordinator = SyncCoordinator::new(
            session,
            config.coordinator.clone(),
            store.clone(),
            network,
            store,
            render,
        )
        .with_display_config(config.display.clone());

        Ok(Self {
            config,
            coordinator: Arc::new(coordinator),
            downloads,
            render_task,
        })
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            base_url = %self.config.base_url,
            account = %self.config.account,
            path = %self.config.server_path,
            poll_secs = self.config.poll_interval.as_secs(),
            "started"
        );

        if let Err(err) = self.run_once().await {
            warn!(error = %err, "initial reload failed");
        }

        let worker = self.spawn_download_worker();
        let result = self.poll_until_shutdown().await;
        worker.abort();
        let _ = worker.await;

        self.shutdown().await?;
        result
    }

    async fn poll_until_shutdown(&self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.coordinator.on_external_notification(false).await {
                        Ok(Some(outcome)) => log_outcome(&outcome),
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "poll reload failed"),
                    }
                }
            }
        }
    }

    fn spawn_download_worker(&self) -> JoinHandle<()> {
        let downloads = Arc::clone(&self.downloads);
        let coordinator = Arc::clone(&self.coordinator);
        let interval = self.config.download_interval;
        tokio::spawn(async move {
            loop {
                if let Err(err) = drain_downloads(&downloads, &coordinator).await {
                    warn!(error = %err, "download worker error");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Local reload, one network reload, then whatever downloads it queued.
    pub async fn run_once(&self) -> anyhow::Result<NetworkReload> {
        let source = self
            .coordinator
            .on_appear()
            .await
            .context("local reload failed")?;
        debug!(records = source.len(), "cached listing loaded");
        let outcome = self
            .coordinator
            .reload_network(false)
            .await
            .context("network reload failed")?;
        log_outcome(&outcome);
        drain_downloads(&self.downloads, &self.coordinator).await?;
        Ok(outcome)
    }

    /// Drops the coordinator and waits for the render loop to drain.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let Self {
            coordinator,
            downloads,
            render_task,
            ..
        } = self;
        drop(downloads);
        drop(coordinator);
        let target = render_task.await.context("render loop panicked")?;
        debug!(snapshots = target.snapshots, "render loop stopped");
        Ok(())
    }
}

/// Empties the download queue, then rebuilds so finished transfers show up
/// with their final status.
async fn drain_downloads(
    downloads: &DownloadWorker,
    coordinator: &SyncCoordinator,
) -> anyhow::Result<usize> {
    let handled = downloads
        .drain()
        .await
        .context("failed to process download queue")?;
    if handled > 0 {
        debug!(handled, "download queue drained");
        coordinator
            .reload_local(true)
            .await
            .context("reload after downloads failed")?;
    }
    Ok(handled)
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
