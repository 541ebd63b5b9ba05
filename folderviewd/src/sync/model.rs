//! Records, directory state and the session value shared by the sync layer.

/// Transfer state of a single record. Only `Normal` means "nothing in flight".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferStatus {
    #[default]
    Normal,
    WaitDownload,
    InDownload,
    Downloading,
    WaitUpload,
    InUpload,
    Uploading,
    DownloadError,
    UploadError,
}

impl TransferStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Normal => "normal",
            TransferStatus::WaitDownload => "wait_download",
            TransferStatus::InDownload => "in_download",
            TransferStatus::Downloading => "downloading",
            TransferStatus::WaitUpload => "wait_upload",
            TransferStatus::InUpload => "in_upload",
            TransferStatus::Uploading => "uploading",
            TransferStatus::DownloadError => "download_error",
            TransferStatus::UploadError => "upload_error",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "normal" => TransferStatus::Normal,
            "wait_download" => TransferStatus::WaitDownload,
            "in_download" => TransferStatus::InDownload,
            "downloading" => TransferStatus::Downloading,
            "wait_upload" => TransferStatus::WaitUpload,
            "in_upload" => TransferStatus::InUpload,
            "uploading" => TransferStatus::Uploading,
            "download_error" => TransferStatus::DownloadError,
            "upload_error" => TransferStatus::UploadError,
            _ => return None,
        })
    }

    pub fn is_normal(&self) -> bool {
        *self == TransferStatus::Normal
    }

    pub fn is_download_pending(&self) -> bool {
        matches!(
            self,
            TransferStatus::WaitDownload | TransferStatus::InDownload | TransferStatus::Downloading
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub oc_id: String,
    pub account: String,
    /// Path of the folder that contains this record.
    pub server_path: String,
    pub file_name: String,
    pub file_id: Option<String>,
    pub is_directory: bool,
    pub status: TransferStatus,
    pub etag: String,
    pub content_type: Option<String>,
    pub size: i64,
    pub modified: Option<i64>,
    pub favorite: bool,
    pub offline: bool,
    pub live_photo: bool,
    pub provider: Option<String>,
    /// Etag of the copy last downloaded to disk. Never set by remote listings.
    pub local_etag: Option<String>,
}

impl MetadataRecord {
    pub fn new(
        oc_id: impl Into<String>,
        account: impl Into<String>,
        server_path: impl Into<String>,
        file_name: impl Into<String>,
        is_directory: bool,
    ) -> Self {
        Self {
            oc_id: oc_id.into(),
            account: account.into(),
            server_path: server_path.into(),
            file_name: file_name.into(),
            file_id: None,
            is_directory,
            status: TransferStatus::Normal,
            etag: String::new(),
            content_type: None,
            size: 0,
            modified: None,
            favorite: false,
            offline: false,
            live_photo: false,
            provider: None,
            local_etag: None,
        }
    }

    /// True when the downloaded copy matches the listed version.
    pub fn has_current_copy(&self) -> bool {
        self.local_etag.as_deref() == Some(self.etag.as_str())
    }

    /// File name without its last extension; dot-files keep their name.
    pub fn file_stem(&self) -> &str {
        match self.file_name.rfind('.') {
            Some(0) | None => &self.file_name,
            Some(idx) => &self.file_name[..idx],
        }
    }

    pub fn extension(&self) -> Option<&str> {
        match self.file_name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&self.file_name[idx + 1..]),
        }
    }
}

/// Cached state of one remote folder. A missing row means a folder that was
/// never listed: no etag, nothing to trust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryState {
    pub account: String,
    pub server_path: String,
    pub oc_id: Option<String>,
    pub etag: Option<String>,
    pub rich_workspace: Option<String>,
    pub favorite: bool,
    pub offline: bool,
}

impl DirectoryState {
    pub fn empty(account: impl Into<String>, server_path: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            server_path: server_path.into(),
            oc_id: None,
            etag: None,
            rich_workspace: None,
            favorite: false,
            offline: false,
        }
    }
}

/// Account and location a coordinator works against. Constructed once by the
/// caller; only `server_path` changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub account: String,
    pub base_url: String,
    pub server_path: String,
}

impl SessionContext {
    pub fn new(
        account: impl Into<String>,
        base_url: impl Into<String>,
        server_path: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            base_url: base_url.into(),
            server_path: server_path.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.account.is_empty() && !self.base_url.is_empty() && !self.server_path.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    Any,
    NotNormal,
}

/// Typed selection of the records directly inside one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub account: String,
    pub server_path: String,
    pub status: StatusFilter,
}

impl RecordQuery {
    pub fn all(account: &str, server_path: &str) -> Self {
        Self {
            account: account.to_string(),
            server_path: server_path.to_string(),
            status: StatusFilter::Any,
        }
    }

    pub fn in_transfer(account: &str, server_path: &str) -> Self {
        Self {
            status: StatusFilter::NotNormal,
            ..Self::all(account, server_path)
        }
    }
}
