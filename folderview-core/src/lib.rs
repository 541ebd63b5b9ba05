mod backoff;
mod client;

pub use backoff::Backoff;
pub use client::{
    ApiErrorClass, EntryType, FileContent, FolderFetch, ListingClient, ListingError, RemoteEntry,
    RemoteFolder, TRANSPORT_FAILURE_CODE,
};
