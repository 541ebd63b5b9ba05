/// Environment accessor; `std::env::var` in production, a map in tests.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Logs every render command. Stands in for a UI when running headless.
#[derive(Debug, Default)]
struct LogRenderTarget {
    snapshots: usize,
    last: Option<Arc<DataSource>>,
}

impl RenderTarget for LogRenderTarget {
    fn render_snapshot(&mut self, source: &Arc<DataSource>) {
        self.snapshots += 1;
        info!(
            records = source.len(),
            sections = source.sections().len(),
            etag = source.etag().unwrap_or("-"),
            "listing updated"
        );
        self.last = Some(Arc::clone(source));
    }

    fn rebuilding(&mut self) {
        debug!("rebuilding listing");
    }

    fn network_activity(&mut self, active: bool) {
        debug!(active, "network activity");
    }

    fn scroll_to(&mut self, position: usize) {
        let name = self
            .last
            .as_ref()
            .and_then(|source| source.get(position))
            .map(|record| record.file_name.as_str())
            .unwrap_or("?");
        info!(position, name, "scroll to");
    }

    fn pulse(&mut self, position: usize, fade: Duration) {
        debug!(position, fade_ms = fade.as_millis() as u64, "pulse");
    }
}

fn log_outcome(outcome: &NetworkReload) {
    match outcome {
        NetworkReload::Completed(report) => {
            if report.updated > 0 || report.deleted > 0 || report.downloads_requested > 0 {
                info!(
                    updated = report.updated,
                    deleted = report.deleted,
                    downloads = report.downloads_requested,
                    "remote delta applied"
                );
            }
        }
        NetworkReload::Coalesced => debug!("network reload coalesced"),
        NetworkReload::DelegatedToSearch => debug!("network reload delegated to search"),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_string_env(env: EnvLookup<'_>, name: &str) -> Option<String> {
    env(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_required_env(env: EnvLookup<'_>, name: &str) -> anyhow::Result<String> {
    read_string_env(env, name).with_context(|| format!("{name} is not set"))
}

fn read_u64_env(env: EnvLookup<'_>, name: &str, default: u64) -> u64 {
    env(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(env: EnvLookup<'_>, name: &str, default: bool) -> bool {
    env(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn parse_publish_mode(value: &str) -> anyhow::Result<PublishMode> {
    match value.to_ascii_lowercase().as_str() {
        "stale_then_fresh" | "stale" => Ok(PublishMode::StaleThenFresh),
        "rebuilding" => Ok(PublishMode::Rebuilding),
        other => anyhow::bail!("unknown FOLDERVIEW_PUBLISH_MODE: {other}"),
    }
}

fn parse_download_policy(value: &str) -> anyhow::Result<DownloadPolicy> {
    match value.to_ascii_lowercase().as_str() {
        "offline_only" | "offline" => Ok(DownloadPolicy::OfflineOnly),
        "all_files" | "all" => Ok(DownloadPolicy::AllFiles),
        "disabled" | "none" => Ok(DownloadPolicy::Disabled),
        other => anyhow::bail!("unknown FOLDERVIEW_DOWNLOAD_POLICY: {other}"),
    }
}

fn parse_sort_key(value: &str) -> anyhow::Result<SortKey> {
    match value.to_ascii_lowercase().as_str() {
        "file_name" | "name" => Ok(SortKey::FileName),
        "modified" | "date" => Ok(SortKey::Modified),
        "size" => Ok(SortKey::Size),
        other => anyhow::bail!("unknown FOLDERVIEW_SORT: {other}"),
    }
}
