use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use folderview_core::{EntryType, FolderFetch, ListingClient, ListingError, RemoteEntry};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use super::model::{DirectoryState, MetadataRecord, RecordQuery};
use super::store::{MetadataStore, StoreError};

/// No HTTP status was received.
pub const TRANSPORT_FAILURE: i32 = folderview_core::TRANSPORT_FAILURE_CODE;
/// The server answered but the body could not be decoded.
pub const INVALID_RESPONSE: i32 = -2;
/// The local store could not be read while computing the delta.
pub const LOCAL_STORE_FAILURE: i32 = -3;

/// Failed listing. `code` is never zero: an HTTP status or one of the
/// negative codes above.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("listing failed ({code}): {description}")]
pub struct ListError {
    pub code: i32,
    pub description: String,
}

impl ListError {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

impl From<ListingError> for ListError {
    fn from(err: ListingError) -> Self {
        let code = match &err {
            ListingError::Request(inner) if inner.is_decode() => INVALID_RESPONSE,
            _ => err.code(),
        };
        ListError::new(code, err.to_string())
    }
}

impl From<StoreError> for ListError {
    fn from(err: StoreError) -> Self {
        ListError::new(LOCAL_STORE_FAILURE, err.to_string())
    }
}

/// One listing of a folder, already diffed against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderListing {
    pub directory: DirectoryState,
    /// Every record of a fresh listing; empty when the server reported no change.
    pub metadatas: Vec<MetadataRecord>,
    pub updated: Vec<MetadataRecord>,
    pub deleted: Vec<String>,
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn list(&self, server_path: &str, forced: bool) -> Result<FolderListing, ListError>;
}

/// Lists folders through [`ListingClient`] and diffs them against a store.
pub struct FolderReader {
    client: ListingClient,
    store: Arc<dyn MetadataStore>,
    account: String,
}

impl FolderReader {
    pub fn new(
        client: ListingClient,
        store: Arc<dyn MetadataStore>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            account: account.into(),
        }
    }
}

#[async_trait]
impl NetworkClient for FolderReader {
    async fn list(&self, server_path: &str, forced: bool) -> Result<FolderListing, ListError> {
        let stored_dir = self
            .store
            .get_directory_state(&self.account, server_path)
            .await?;
        let known_etag = if forced {
            None
        } else {
            stored_dir.as_ref().and_then(|d| d.etag.as_deref())
        };

        let fetch = self.client.read_folder(server_path, known_etag).await?;
        let folder = match fetch {
            FolderFetch::NotModified => {
                debug!(path = server_path, "folder not modified");
                return Ok(FolderListing {
                    directory: stored_dir
                        .unwrap_or_else(|| DirectoryState::empty(&self.account, server_path)),
                    metadatas: Vec::new(),
                    updated: Vec::new(),
                    deleted: Vec::new(),
                });
            }
            FolderFetch::Listed(folder) => folder,
        };

        let stored: HashMap<String, MetadataRecord> = self
            .store
            .query(&RecordQuery::all(&self.account, server_path))
            .await?
            .into_iter()
            .map(|record| (record.oc_id.clone(), record))
            .collect();

        let mut metadatas = Vec::with_capacity(folder.items.len());
        let mut updated = Vec::new();
        for entry in &folder.items {
            let mut record = record_from_entry(&self.account, server_path, entry);
            match stored.get(&record.oc_id) {
                Some(previous) => {
                    record.status = previous.status;
                    record.offline = previous.offline;
                    record.local_etag = previous.local_etag.clone();
                    if changed(previous, &record) {
                        updated.push(record.clone());
                    }
                }
                None => updated.push(record.clone()),
            }
            metadatas.push(record);
        }

        let remote_ids: HashSet<&str> = folder
            .items
            .iter()
            .map(|entry| entry.oc_id.as_str())
            .collect();
        let mut deleted: Vec<String> = stored
            .keys()
            .filter(|oc_id| !remote_ids.contains(oc_id.as_str()))
            .cloned()
            .collect();
        deleted.sort();

        let directory = DirectoryState {
            account: self.account.clone(),
            server_path: server_path.to_string(),
            oc_id: folder.oc_id,
            etag: Some(folder.etag),
            rich_workspace: folder.rich_workspace,
            favorite: folder.favorite,
            offline: stored_dir.is_some_and(|d| d.offline),
        };

        Ok(FolderListing {
            directory,
            metadatas,
            updated,
            deleted,
        })
    }
}

fn changed(previous: &MetadataRecord, current: &MetadataRecord) -> bool {
    previous.etag != current.etag
        || previous.favorite != current.favorite
        || previous.file_name != current.file_name
}

fn record_from_entry(account: &str, server_path: &str, entry: &RemoteEntry) -> MetadataRecord {
    let mut record = MetadataRecord::new(
        entry.oc_id.as_str(),
        account,
        server_path,
        entry.name.as_str(),
        entry.entry_type == EntryType::Dir,
    );
    record.file_id = entry.file_id.clone();
    record.etag = entry.etag.clone();
    record.content_type = entry.content_type.clone();
    record.size = entry
        .size
        .map(|size| i64::try_from(size).unwrap_or(i64::MAX))
        .unwrap_or(0);
    record.modified = entry.modified.as_deref().and_then(parse_modified);
    record.favorite = entry.favorite;
    record.live_photo = entry.live_photo;
    record.provider = entry.provider.clone();
    record
}

fn parse_modified(value: &str) -> Option<i64> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|stamp| stamp.unix_timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::TransferStatus;
    use crate::sync::store::{IndexStore, memory_store};
    use serde_json::json;
    use wiremock::matchers::{header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn listing_body(etag: &str, items: serde_json::Value) -> serde_json::Value {
        json!({
            "etag": etag,
            "oc_id": "dir-1",
            "rich_workspace": "# Notes",
            "items": items,
        })
    }

    async fn reader_for(server: &MockServer) -> (FolderReader, Arc<IndexStore>) {
        let store = Arc::new(memory_store().await);
        let client = ListingClient::new(&server.uri(), "token").unwrap();
        let reader = FolderReader::new(client, store.clone(), "alice");
        (reader, store)
    }

    #[tokio::test]
    async fn fresh_listing_reports_everything_as_updated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/folders"))
            .and(query_param("path", "/Docs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_body(
                "e1",
                json!([
                    { "oc_id": "1", "name": "a.txt", "type": "file", "etag": "x",
                      "size": 12, "modified": "2024-03-01T10:00:00Z" },
                    { "oc_id": "2", "name": "Sub", "type": "dir", "etag": "y" },
                ]),
            )))
            .mount(&server)
            .await;
        let (reader, _store) = reader_for(&server).await;

        let listing = reader.list("/Docs", false).await.unwrap();

        assert_eq!(listing.directory.etag.as_deref(), Some("e1"));
        assert_eq!(listing.directory.rich_workspace.as_deref(), Some("# Notes"));
        assert_eq!(listing.updated.len(), 2);
        assert!(listing.deleted.is_empty());
        let file = &listing.metadatas[0];
        assert_eq!(file.size, 12);
        assert_eq!(file.modified, Some(1_709_287_200));
        assert!(listing.metadatas[1].is_directory);
    }

    #[tokio::test]
    async fn diff_against_store_finds_changes_and_removals() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/folders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_body(
                "e2",
                json!([
                    { "oc_id": "1", "name": "a.txt", "type": "file", "etag": "same" },
                    { "oc_id": "2", "name": "b.txt", "type": "file", "etag": "new" },
                ]),
            )))
            .mount(&server)
            .await;
        let (reader, store) = reader_for(&server).await;

        let mut a = MetadataRecord::new("1", "alice", "/Docs", "a.txt", false);
        a.etag = "same".into();
        let mut b = MetadataRecord::new("2", "alice", "/Docs", "b.txt", false);
        b.etag = "old".into();
        let gone = MetadataRecord::new("3", "alice", "/Docs", "c.txt", false);
        store.apply_delta(&[a, b, gone], &[]).await.unwrap();
        store
            .set_status("1", TransferStatus::Downloading)
            .await
            .unwrap();

        let listing = reader.list("/Docs", false).await.unwrap();

        let updated: Vec<&str> = listing.updated.iter().map(|r| r.oc_id.as_str()).collect();
        assert_eq!(updated, vec!["2"]);
        assert_eq!(listing.deleted, vec!["3".to_string()]);
        assert_eq!(listing.metadatas[0].status, TransferStatus::Downloading);
    }

    #[tokio::test]
    async fn known_etag_is_sent_and_not_modified_keeps_stored_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/folders"))
            .and(header("if-none-match", "\"e1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;
        let (reader, store) = reader_for(&server).await;
        let mut directory = DirectoryState::empty("alice", "/Docs");
        directory.etag = Some("e1".into());
        store.put_directory_state(&directory).await.unwrap();

        let listing = reader.list("/Docs", false).await.unwrap();

        assert_eq!(listing.directory, directory);
        assert!(listing.metadatas.is_empty());
        assert!(listing.updated.is_empty());
        assert!(listing.deleted.is_empty());
    }

    #[tokio::test]
    async fn forced_listing_skips_the_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/folders"))
            .and(header_exists("if-none-match"))
            .respond_with(ResponseTemplate::new(304))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/folders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_body("e2", json!([]))))
            .mount(&server)
            .await;
        let (reader, store) = reader_for(&server).await;
        let mut directory = DirectoryState::empty("alice", "/Docs");
        directory.etag = Some("e1".into());
        store.put_directory_state(&directory).await.unwrap();

        let listing = reader.list("/Docs", true).await.unwrap();

        assert_eq!(listing.directory.etag.as_deref(), Some("e2"));
    }

    #[tokio::test]
    async fn http_failure_maps_to_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/folders"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such folder"))
            .mount(&server)
            .await;
        let (reader, _store) = reader_for(&server).await;

        let err = reader.list("/Missing", false).await.unwrap_err();

        assert_eq!(err.code, 404);
        assert!(err.description.contains("no such folder"));
    }

    #[tokio::test]
    async fn undecodable_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/folders"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;
        let (reader, _store) = reader_for(&server).await;

        let err = reader.list("/Docs", false).await.unwrap_err();

        assert_eq!(err.code, INVALID_RESPONSE);
    }

    #[tokio::test]
    async fn unreachable_server_is_transport_failure() {
        let client = ListingClient::new("http://127.0.0.1:9", "token")
            .unwrap()
            .with_retry(folderview_core::Backoff::default(), 0);
        let reader = FolderReader::new(client, Arc::new(memory_store().await), "alice");

        let err = reader.list("/Docs", false).await.unwrap_err();

        assert_eq!(err.code, TRANSPORT_FAILURE);
    }

    #[test]
    fn unparseable_timestamps_are_dropped() {
        assert_eq!(parse_modified("yesterday"), None);
        assert_eq!(parse_modified("1970-01-01T00:00:10Z"), Some(10));
    }
}
