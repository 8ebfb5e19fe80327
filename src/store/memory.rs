use super::{BlobStore, RecordStore, StoreError, public_object_url};
use crate::models::{
    ImageRecord, ListOrder, ListQuery, ListingColumns, ListingPage, ListingRecord, NewImage,
};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MEMORY_BASE_URL: &str = "https://memory.local";

/// In-process record + blob store.
///
/// Used when no Supabase project is configured and as the test double for
/// the lifecycle and catalog modules. `fail_on` makes a named operation
/// return an error, which is how tests exercise halting and compensation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
    bucket: String,
}

#[derive(Default)]
struct MemoryState {
    listings: Vec<ListingRecord>,
    images: Vec<ImageRecord>,
    blobs: BTreeMap<String, Vec<u8>>,
    failing: HashSet<&'static str>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            inner: Arc::default(),
            bucket: bucket.into(),
        }
    }

    pub fn image_rows(&self, listing_id: Uuid) -> Vec<ImageRecord> {
        let mut rows: Vec<ImageRecord> = self
            .state()
            .images
            .iter()
            .filter(|image| image.listing_id == listing_id)
            .cloned()
            .collect();
        rows.sort_by_key(|image| image.idx);
        rows
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked(&self, operation: &'static str) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let state = self.state();
        if state.failing.contains(operation) {
            return Err(StoreError::Request(format!("{operation} unavailable")));
        }
        Ok(state)
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Makes every later call of `operation` fail until `recover` is called.
    pub fn fail_on(&self, operation: &'static str) {
        self.state().failing.insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.state().failing.remove(operation);
    }

    /// Object paths under `prefix`.
    pub fn blob_paths(&self, prefix: &str) -> Vec<String> {
        self.state()
            .blobs
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn blob(&self, path: &str) -> Option<Vec<u8>> {
        self.state().blobs.get(path).cloned()
    }

    pub fn listing(&self, id: Uuid) -> Option<ListingRecord> {
        self.state()
            .listings
            .iter()
            .find(|listing| listing.id == id)
            .cloned()
    }

    pub fn listing_count(&self) -> usize {
        self.state().listings.len()
    }
}

fn cancelled(token: &CancellationToken) -> Result<(), StoreError> {
    if token.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_listings(
        &self,
        query: &ListQuery,
        token: &CancellationToken,
    ) -> Result<ListingPage, StoreError> {
        cancelled(token)?;
        let state = self.checked("list_listings")?;
        let wanted = query.type_filter.listing_type();
        let mut rows: Vec<ListingRecord> = state
            .listings
            .iter()
            .filter(|row| wanted.is_none_or(|kind| row.columns.listing_type == kind))
            .cloned()
            .collect();
        match query.order {
            ListOrder::Newest => {
                rows.reverse();
                rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
            ListOrder::PriceAsc => rows.sort_by_key(|row| row.columns.price_tl),
            ListOrder::PriceDesc => {
                rows.sort_by(|a, b| b.columns.price_tl.cmp(&a.columns.price_tl))
            }
        }
        let total = rows.len() as u64;
        let (from, to) = query.range();
        let items = rows
            .into_iter()
            .skip(from as usize)
            .take((to - from + 1) as usize)
            .collect();
        Ok(ListingPage { items, total })
    }

    async fn get_listing(
        &self,
        id: Uuid,
        token: &CancellationToken,
    ) -> Result<Option<ListingRecord>, StoreError> {
        cancelled(token)?;
        let state = self.checked("get_listing")?;
        Ok(state.listings.iter().find(|row| row.id == id).cloned())
    }

    async fn list_images(
        &self,
        listing_id: Uuid,
        token: &CancellationToken,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        cancelled(token)?;
        drop(self.checked("list_images")?);
        Ok(self.image_rows(listing_id))
    }

    async fn insert_listing(&self, columns: &ListingColumns) -> Result<Uuid, StoreError> {
        let mut state = self.checked("insert_listing")?;
        let id = Uuid::new_v4();
        state.listings.push(ListingRecord {
            id,
            columns: columns.clone(),
            cover_url: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn update_listing(&self, id: Uuid, columns: &ListingColumns) -> Result<(), StoreError> {
        let mut state = self.checked("update_listing")?;
        if let Some(row) = state.listings.iter_mut().find(|row| row.id == id) {
            row.columns = columns.clone();
        }
        Ok(())
    }

    async fn set_cover(&self, id: Uuid, cover_url: Option<&str>) -> Result<(), StoreError> {
        let mut state = self.checked("set_cover")?;
        if let Some(row) = state.listings.iter_mut().find(|row| row.id == id) {
            row.cover_url = cover_url.map(str::to_string);
        }
        Ok(())
    }

    async fn delete_listing(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.checked("delete_listing")?;
        state.listings.retain(|row| row.id != id);
        Ok(())
    }

    async fn insert_images(&self, images: &[NewImage]) -> Result<Vec<ImageRecord>, StoreError> {
        let mut state = self.checked("insert_images")?;
        let inserted: Vec<ImageRecord> = images
            .iter()
            .map(|image| ImageRecord {
                id: image.id.unwrap_or_else(Uuid::new_v4),
                listing_id: image.listing_id,
                url: image.url.clone(),
                idx: image.idx,
            })
            .collect();
        state.images.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn delete_images(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut state = self.checked("delete_images")?;
        state.images.retain(|image| !ids.contains(&image.id));
        Ok(())
    }

    async fn reorder_images(&self, images: &[ImageRecord]) -> Result<(), StoreError> {
        let mut state = self.checked("reorder_images")?;
        for wanted in images {
            if let Some(row) = state.images.iter_mut().find(|row| row.id == wanted.id) {
                row.idx = wanted.idx;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn public_url(&self, path: &str) -> String {
        public_object_url(MEMORY_BASE_URL, &self.bucket, path)
    }

    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        let mut state = self.checked("upload")?;
        if state.blobs.contains_key(path) {
            return Err(StoreError::Status {
                status: 409,
                body: format!("object already exists: {path}"),
            });
        }
        state.blobs.insert(path.to_string(), bytes);
        drop(state);
        Ok(self.public_url(path))
    }

    async fn remove(&self, paths: &[String]) -> Result<(), StoreError> {
        let mut state = self.checked("remove")?;
        for path in paths {
            state.blobs.remove(path);
        }
        Ok(())
    }
}
