pub mod memory;
pub mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseClient;

use crate::models::{ImageRecord, ListQuery, ListingColumns, ListingPage, ListingRecord, NewImage};
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("request cancelled")]
    Cancelled,
}

/// Structured record store holding `listings` and `listing_images`.
///
/// Reads take a cancellation token so they can be driven by the retry layer;
/// writes run to completion.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_listings(
        &self,
        query: &ListQuery,
        token: &CancellationToken,
    ) -> Result<ListingPage, StoreError>;

    async fn get_listing(
        &self,
        id: Uuid,
        token: &CancellationToken,
    ) -> Result<Option<ListingRecord>, StoreError>;

    /// Images of a listing ordered by `idx`.
    async fn list_images(
        &self,
        listing_id: Uuid,
        token: &CancellationToken,
    ) -> Result<Vec<ImageRecord>, StoreError>;

    async fn insert_listing(&self, columns: &ListingColumns) -> Result<Uuid, StoreError>;

    async fn update_listing(&self, id: Uuid, columns: &ListingColumns) -> Result<(), StoreError>;

    async fn set_cover(&self, id: Uuid, cover_url: Option<&str>) -> Result<(), StoreError>;

    async fn delete_listing(&self, id: Uuid) -> Result<(), StoreError>;

    async fn insert_images(&self, images: &[NewImage]) -> Result<Vec<ImageRecord>, StoreError>;

    async fn delete_images(&self, ids: &[Uuid]) -> Result<(), StoreError>;

    /// Writes every row's `idx` in one batch.
    async fn reorder_images(&self, images: &[ImageRecord]) -> Result<(), StoreError>;
}

/// Blob store addressed by per-listing paths inside one bucket.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn public_url(&self, path: &str) -> String;

    /// Uploads an object and returns its public URL.
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError>;

    async fn remove(&self, paths: &[String]) -> Result<(), StoreError>;

    fn path_from_url(&self, url: &str) -> Option<String> {
        storage_path_from_public_url(url)
    }
}

const PUBLIC_OBJECT_MARKER: &str = "/object/public/";

/// Recovers the in-bucket object path from a public URL of the form
/// `…/object/public/<bucket>/<path>`.
pub fn storage_path_from_public_url(url: &str) -> Option<String> {
    let start = url.find(PUBLIC_OBJECT_MARKER)? + PUBLIC_OBJECT_MARKER.len();
    let rest = &url[start..];
    let (_bucket, path) = rest.split_once('/')?;
    if path.is_empty() {
        return None;
    }
    urlencoding::decode(path).ok().map(|decoded| decoded.into_owned())
}

pub fn public_object_url(base: &str, bucket: &str, path: &str) -> String {
    let encoded = path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{base}/storage/v1{PUBLIC_OBJECT_MARKER}{bucket}/{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_round_trips_through_public_url() {
        let url = public_object_url(
            "https://abc.supabase.co",
            "listing-images",
            "9b1c/1700000000000_0_ab12.jpeg",
        );
        assert_eq!(
            url,
            "https://abc.supabase.co/storage/v1/object/public/listing-images/9b1c/1700000000000_0_ab12.jpeg"
        );
        assert_eq!(
            storage_path_from_public_url(&url).as_deref(),
            Some("9b1c/1700000000000_0_ab12.jpeg")
        );
    }

    #[test]
    fn path_resolution_decodes_and_rejects_foreign_urls() {
        assert_eq!(
            storage_path_from_public_url(
                "https://x.co/storage/v1/object/public/b/id/kat%20plan%C4%B1.png"
            )
            .as_deref(),
            Some("id/kat planı.png")
        );
        assert_eq!(storage_path_from_public_url("https://cdn.example.com/a.jpg"), None);
        assert_eq!(
            storage_path_from_public_url("https://x.co/storage/v1/object/public/bucket-only"),
            None
        );
    }
}
