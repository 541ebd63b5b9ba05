use std::time::{Duration, SystemTime};

use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::backoff::Backoff;

const DEFAULT_MAX_RETRIES: u32 = 3;
const FOLDERS_ENDPOINT: &str = "/v1/folders";
const FILES_ENDPOINT: &str = "/v1/files";

/// Error code reported for failures that never produced an HTTP status.
pub const TRANSPORT_FAILURE_CODE: i32 = -1;

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl ListingError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ListingError::Api { status, .. } => Some(classify_api_status(*status)),
            ListingError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    /// Numeric code surfaced to callers: the HTTP status when there was one.
    pub fn code(&self) -> i32 {
        match self {
            ListingError::Api { status, .. } => i32::from(status.as_u16()),
            ListingError::Request(err) => err
                .status()
                .map(|status| i32::from(status.as_u16()))
                .unwrap_or(TRANSPORT_FAILURE_CODE),
            ListingError::Url(_) => TRANSPORT_FAILURE_CODE,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ListingError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Result of a conditional folder read.
#[derive(Debug, Clone, PartialEq)]
pub enum FolderFetch {
    /// The server confirmed the folder still matches the supplied etag.
    NotModified,
    Listed(RemoteFolder),
}

#[derive(Clone)]
pub struct ListingClient {
    http: Client,
    base_url: Url,
    token: String,
    backoff: Backoff,
    max_retries: u32,
}

impl ListingClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ListingError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
            backoff: Backoff::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_retry(mut self, backoff: Backoff, max_retries: u32) -> Self {
        self.backoff = backoff;
        self.max_retries = max_retries;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Lists `path`. With `known_etag` set the request is conditional and a
    /// `304` comes back as [`FolderFetch::NotModified`]. Rate-limit and
    /// transient failures are retried here with backoff.
    pub async fn read_folder(
        &self,
        path: &str,
        known_etag: Option<&str>,
    ) -> Result<FolderFetch, ListingError> {
        let mut attempt = 0u32;
        loop {
            match self.read_folder_once(path, known_etag).await {
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff.delay(attempt, err.retry_after());
                    debug!(path, attempt, ?delay, error = %err, "retrying folder listing");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn read_folder_once(
        &self,
        path: &str,
        known_etag: Option<&str>,
    ) -> Result<FolderFetch, ListingError> {
        let mut url = self.endpoint(FOLDERS_ENDPOINT)?;
        url.query_pairs_mut().append_pair("path", path);
        let mut request = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value());
        if let Some(etag) = known_etag {
            request = request.header(header::IF_NONE_MATCH, quote_etag(etag));
        }
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_MODIFIED && known_etag.is_some() {
            return Ok(FolderFetch::NotModified);
        }
        Self::handle_response(response).await.map(FolderFetch::Listed)
    }

    /// Downloads the content of the file at `path`, retrying like
    /// [`read_folder`](Self::read_folder).
    pub async fn fetch_file(&self, path: &str) -> Result<FileContent, ListingError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_file_once(path).await {
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff.delay(attempt, err.retry_after());
                    debug!(path, attempt, ?delay, error = %err, "retrying file download");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn fetch_file_once(&self, path: &str) -> Result<FileContent, ListingError> {
        let mut url = self.endpoint(FILES_ENDPOINT)?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(unquote_etag);
        let bytes = response.bytes().await?.to_vec();
        Ok(FileContent { etag, bytes })
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ListingError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ListingError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> ListingError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        ListingError::Api {
            status,
            body,
            retry_after,
        }
    }
}

/// Downloaded file body and the etag the server reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub etag: Option<String>,
    pub bytes: Vec<u8>,
}

fn unquote_etag(value: &str) -> String {
    value
        .trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .to_string()
}

fn quote_etag(etag: &str) -> String {
    if etag.starts_with('"') || etag.starts_with("W/") {
        etag.to_string()
    } else {
        format!("\"{etag}\"")
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RemoteFolder {
    pub etag: String,
    #[serde(default)]
    pub oc_id: Option<String>,
    #[serde(default)]
    pub rich_workspace: Option<String>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub items: Vec<RemoteEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RemoteEntry {
    pub oc_id: String,
    #[serde(default)]
    pub file_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub etag: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub live_photo: bool,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
}
