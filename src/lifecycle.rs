use crate::images::{ImageOrder, ImagePlan, ImageSlot, MAX_PERSIST_IMAGES, StagedImage};
use crate::importer::{ImportedListing, import_text, size_label};
use crate::models::{ImageRecord, ListingColumns, ListingFields, ListingRecord, ListingType, NewImage, parse_price};
use crate::store::{BlobStore, RecordStore, StoreError};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Importing,
    Editing,
    Validating,
    Persisting,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("{0}")]
    Persistence(StoreError),
    #[error("{0}")]
    Storage(StoreError),
    #[error("listing {0} not found")]
    NotFound(Uuid),
    #[error("stored images changed during the update: {0}")]
    Conflict(String),
    #[error("another submission is still in progress")]
    Busy,
}

impl LifecycleError {
    pub fn stage(&self) -> &'static str {
        match self {
            LifecycleError::Validation(_) => "validation",
            LifecycleError::Persistence(_) => "persistence",
            LifecycleError::Storage(_) => "storage",
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::Conflict(_) => "conflict",
            LifecycleError::Busy => "busy",
        }
    }
}

/// Checks everything that must hold before anything is written. Returns the
/// listing type so callers do not have to unwrap it again.
pub fn validate(
    fields: &ListingFields,
    images: &ImageOrder,
    mode: WriteMode,
) -> Result<ListingType, LifecycleError> {
    let mut problems = Vec::new();
    if fields.title.trim().is_empty() {
        problems.push("title is required".to_string());
    }
    if fields.address.trim().is_empty() {
        problems.push("address is required".to_string());
    }
    if fields.price_line.trim().is_empty() {
        problems.push("price line is required".to_string());
    } else if parse_price(&fields.price_line).is_none() {
        problems.push("price line has no readable amount".to_string());
    }
    if fields.listing_type.is_none() {
        problems.push("type must be Satılık or Kiralık".to_string());
    }
    if images.is_empty() {
        problems.push("at least one photo is required".to_string());
    }
    if mode == WriteMode::Create {
        if size_label(&fields.specs).is_empty() {
            problems.push("room count or area is required".to_string());
        }
        if images.staged_count() != images.len() {
            problems.push("a new listing can only use newly selected photos".to_string());
        }
    }
    match fields.listing_type {
        Some(kind) if problems.is_empty() => Ok(kind),
        _ => Err(LifecycleError::Validation(problems)),
    }
}

/// Editor fields pre-filled from imported text.
pub fn fields_from_import(imported: &ImportedListing) -> ListingFields {
    ListingFields {
        address: imported.address_line.clone(),
        price_line: imported.price_line.clone(),
        specs: imported.specs.clone(),
        ..Default::default()
    }
}

/// Maps the desired URL order onto the freshly fetched rows and assigns
/// dense indices. Rows nobody asked for (another editor's uploads) keep their
/// relative order after the requested ones.
pub fn reconcile_order(
    desired_urls: &[String],
    mut stored: Vec<ImageRecord>,
) -> Result<Vec<ImageRecord>, LifecycleError> {
    stored.sort_by_key(|row| row.idx);
    let by_url: HashMap<&str, &ImageRecord> =
        stored.iter().map(|row| (row.url.as_str(), row)).collect();
    let mut used = HashSet::new();
    let mut ordered = Vec::with_capacity(stored.len());
    for url in desired_urls {
        let row = by_url
            .get(url.as_str())
            .ok_or_else(|| LifecycleError::Conflict(format!("{url} is no longer stored")))?;
        if used.insert(row.id) {
            ordered.push(ImageRecord {
                idx: ordered.len() as i32,
                ..(*row).clone()
            });
        }
    }
    for row in &stored {
        if used.insert(row.id) {
            ordered.push(ImageRecord {
                idx: ordered.len() as i32,
                ..row.clone()
            });
        }
    }
    Ok(ordered)
}

/// Everything an editor needs to change an existing listing.
#[derive(Debug, Clone)]
pub struct EditSession {
    pub record: ListingRecord,
    pub fields: ListingFields,
    pub images: Vec<ImageRecord>,
    pub order: ImageOrder,
}

/// Inverse of one completed write step.
#[derive(Debug)]
enum Compensation {
    DeleteListing(Uuid),
    RemoveBlobs(Vec<String>),
    DeleteImageRows(Vec<Uuid>),
    RestoreImageRows(Vec<ImageRecord>),
    RestoreListing {
        id: Uuid,
        columns: Box<ListingColumns>,
    },
    RestoreOrder(Vec<ImageRecord>),
}

impl Compensation {
    fn name(&self) -> &'static str {
        match self {
            Compensation::DeleteListing(_) => "delete_listing",
            Compensation::RemoveBlobs(_) => "remove_blobs",
            Compensation::DeleteImageRows(_) => "delete_image_rows",
            Compensation::RestoreImageRows(_) => "restore_image_rows",
            Compensation::RestoreListing { .. } => "restore_listing",
            Compensation::RestoreOrder(_) => "restore_order",
        }
    }

    async fn apply(
        &self,
        records: &dyn RecordStore,
        blobs: &dyn BlobStore,
    ) -> Result<(), StoreError> {
        match self {
            Compensation::DeleteListing(id) => records.delete_listing(*id).await,
            Compensation::RemoveBlobs(paths) => blobs.remove(paths).await,
            Compensation::DeleteImageRows(ids) => records.delete_images(ids).await,
            Compensation::RestoreImageRows(rows) => {
                let rows: Vec<NewImage> = rows.iter().map(NewImage::from).collect();
                records.insert_images(&rows).await.map(drop)
            }
            Compensation::RestoreListing { id, columns } => {
                records.update_listing(*id, columns).await
            }
            Compensation::RestoreOrder(rows) => records.reorder_images(rows).await,
        }
    }
}

/// Inverses of the steps completed so far, undone newest first.
#[derive(Debug, Default)]
struct Compensations(Vec<Compensation>);

impl Compensations {
    fn push(&mut self, action: Compensation) {
        self.0.push(action);
    }

    async fn unwind(self, records: &dyn RecordStore, blobs: &dyn BlobStore) {
        for action in self.0.into_iter().rev() {
            match action.apply(records, blobs).await {
                Ok(()) => info!(
                    target = "emlak.lifecycle",
                    action = action.name(),
                    "compensation applied"
                ),
                Err(err) => warn!(
                    target = "emlak.lifecycle",
                    action = action.name(),
                    error = %err,
                    "compensation failed"
                ),
            }
        }
    }
}

#[derive(Debug, Default)]
struct BusyFlag(AtomicBool);

struct BusyGuard<'a>(&'a AtomicBool);

impl BusyFlag {
    fn acquire(&self) -> Result<BusyGuard<'_>, LifecycleError> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| LifecycleError::Busy)?;
        Ok(BusyGuard(&self.0))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns every write to listings and their photos.
///
/// One submission runs at a time per manager; a second one is rejected with
/// [`LifecycleError::Busy`] instead of queueing. When a create or update step
/// fails, the steps already completed are undone in reverse order and the
/// original error is returned unchanged.
pub struct ListingManager {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    max_images: usize,
    busy: BusyFlag,
    state: Mutex<LifecycleState>,
}

impl ListingManager {
    pub fn new(records: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            records,
            blobs,
            max_images: MAX_PERSIST_IMAGES,
            busy: BusyFlag::default(),
            state: Mutex::new(LifecycleState::Idle),
        }
    }

    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images.max(1);
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(LifecycleState::Error)
    }

    fn enter(&self, next: LifecycleState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    pub fn import(&self, text: &str) -> ImportedListing {
        self.enter(LifecycleState::Importing);
        let imported = import_text(text);
        self.enter(LifecycleState::Editing);
        imported
    }

    pub async fn get_for_edit(&self, id: Uuid) -> Result<EditSession, LifecycleError> {
        let token = CancellationToken::new();
        let record = self
            .records
            .get_listing(id, &token)
            .await
            .map_err(LifecycleError::Persistence)?
            .ok_or(LifecycleError::NotFound(id))?;
        let images = self
            .records
            .list_images(id, &token)
            .await
            .map_err(LifecycleError::Persistence)?;
        self.enter(LifecycleState::Editing);
        Ok(EditSession {
            fields: record.fields(),
            order: ImageOrder::from_persisted(images.clone()),
            record,
            images,
        })
    }

    pub async fn create(
        &self,
        fields: ListingFields,
        images: ImageOrder,
    ) -> Result<Uuid, LifecycleError> {
        let _busy = self.busy.acquire()?;
        self.finish("create", async {
            self.enter(LifecycleState::Validating);
            let listing_type = validate(&fields, &images, WriteMode::Create)?;
            self.enter(LifecycleState::Persisting);
            let columns = ListingColumns::from_fields(&fields, listing_type);
            let plan = images.into_plan(self.max_images);
            let mut undo = Compensations::default();
            match self.create_steps(&columns, &plan, &mut undo).await {
                Ok(id) => Ok(id),
                Err(err) => {
                    undo.unwind(self.records.as_ref(), self.blobs.as_ref()).await;
                    Err(err)
                }
            }
        })
        .await
    }

    pub async fn update(
        &self,
        id: Uuid,
        fields: ListingFields,
        images: ImageOrder,
    ) -> Result<(), LifecycleError> {
        let _busy = self.busy.acquire()?;
        self.finish("update", async {
            self.enter(LifecycleState::Validating);
            let listing_type = validate(&fields, &images, WriteMode::Update)?;
            self.enter(LifecycleState::Persisting);
            let columns = ListingColumns::from_fields(&fields, listing_type);
            let plan = images.into_plan(self.max_images);
            let mut undo = Compensations::default();
            let removed_paths = match self.update_steps(id, &columns, &plan, &mut undo).await {
                Ok(paths) => paths,
                Err(err) => {
                    undo.unwind(self.records.as_ref(), self.blobs.as_ref()).await;
                    return Err(err);
                }
            };
            // Blob deletion cannot be undone, so it runs only once everything
            // else is committed. A failure here leaves unreferenced objects.
            if !removed_paths.is_empty() {
                self.step("remove_blobs", async {
                    self.blobs
                        .remove(&removed_paths)
                        .await
                        .map_err(LifecycleError::Storage)
                })
                .await?;
            }
            Ok(())
        })
        .await
    }

    /// Removes the photos (objects first, then rows) and then the listing.
    pub async fn delete(&self, id: Uuid) -> Result<(), LifecycleError> {
        let _busy = self.busy.acquire()?;
        self.finish("delete", async {
            self.enter(LifecycleState::Persisting);
            let token = CancellationToken::new();
            self.step("fetch_listing", async {
                self.records
                    .get_listing(id, &token)
                    .await
                    .map_err(LifecycleError::Persistence)?
                    .ok_or(LifecycleError::NotFound(id))
            })
            .await?;
            let images = self
                .step("fetch_images", async {
                    self.records
                        .list_images(id, &token)
                        .await
                        .map_err(LifecycleError::Persistence)
                })
                .await?;
            let paths: Vec<String> = images
                .iter()
                .filter_map(|image| self.blobs.path_from_url(&image.url))
                .collect();
            if !paths.is_empty() {
                self.step("remove_blobs", async {
                    self.blobs
                        .remove(&paths)
                        .await
                        .map_err(LifecycleError::Storage)
                })
                .await?;
            }
            if !images.is_empty() {
                let ids: Vec<Uuid> = images.iter().map(|image| image.id).collect();
                self.step("delete_image_rows", async {
                    self.records
                        .delete_images(&ids)
                        .await
                        .map_err(LifecycleError::Persistence)
                })
                .await?;
            }
            self.step("delete_listing", async {
                self.records
                    .delete_listing(id)
                    .await
                    .map_err(LifecycleError::Persistence)
            })
            .await?;
            Ok(())
        })
        .await
    }

    async fn create_steps(
        &self,
        columns: &ListingColumns,
        plan: &ImagePlan,
        undo: &mut Compensations,
    ) -> Result<Uuid, LifecycleError> {
        let id = self
            .step("insert_listing", async {
                self.records
                    .insert_listing(columns)
                    .await
                    .map_err(LifecycleError::Persistence)
            })
            .await?;
        undo.push(Compensation::DeleteListing(id));

        let mut rows = Vec::with_capacity(plan.slots.len());
        for (position, slot) in plan.slots.iter().enumerate() {
            if let ImageSlot::Staged(image) = slot {
                let url = self.upload(id, position, image, undo).await?;
                rows.push(NewImage {
                    id: None,
                    listing_id: id,
                    url,
                    idx: rows.len() as i32,
                });
            }
        }

        let inserted = self.insert_rows(&rows, undo).await?;
        let cover = inserted
            .iter()
            .find(|row| row.idx == 0)
            .map(|row| row.url.clone());
        self.step("set_cover", async {
            self.records
                .set_cover(id, cover.as_deref())
                .await
                .map_err(LifecycleError::Persistence)
        })
        .await?;
        info!(
            target = "emlak.lifecycle",
            listing_id = %id,
            images = inserted.len(),
            "listing created"
        );
        Ok(id)
    }

    /// Returns the object paths of removed photos, still to be deleted.
    async fn update_steps(
        &self,
        id: Uuid,
        columns: &ListingColumns,
        plan: &ImagePlan,
        undo: &mut Compensations,
    ) -> Result<Vec<String>, LifecycleError> {
        let token = CancellationToken::new();
        let current = self
            .step("fetch_listing", async {
                self.records
                    .get_listing(id, &token)
                    .await
                    .map_err(LifecycleError::Persistence)?
                    .ok_or(LifecycleError::NotFound(id))
            })
            .await?;
        let stored = self
            .step("fetch_images", async {
                self.records
                    .list_images(id, &token)
                    .await
                    .map_err(LifecycleError::Persistence)
            })
            .await?;

        self.step("update_listing", async {
            self.records
                .update_listing(id, columns)
                .await
                .map_err(LifecycleError::Persistence)
        })
        .await?;
        undo.push(Compensation::RestoreListing {
            id,
            columns: Box::new(current.columns.clone()),
        });

        let removed: Vec<ImageRecord> = stored
            .iter()
            .filter(|row| plan.deletions.contains(&row.id))
            .cloned()
            .collect();
        let removed_paths: Vec<String> = removed
            .iter()
            .filter_map(|row| self.blobs.path_from_url(&row.url))
            .collect();
        if !removed.is_empty() {
            let ids: Vec<Uuid> = removed.iter().map(|row| row.id).collect();
            self.step("delete_image_rows", async {
                self.records
                    .delete_images(&ids)
                    .await
                    .map_err(LifecycleError::Persistence)
            })
            .await?;
            undo.push(Compensation::RestoreImageRows(removed));
        }

        let mut desired = Vec::with_capacity(plan.slots.len());
        let mut rows = Vec::new();
        for (position, slot) in plan.slots.iter().enumerate() {
            match slot {
                ImageSlot::Persisted { url, .. } => desired.push(url.clone()),
                ImageSlot::Staged(image) => {
                    let url = self.upload(id, position, image, undo).await?;
                    rows.push(NewImage {
                        id: None,
                        listing_id: id,
                        url: url.clone(),
                        idx: position as i32,
                    });
                    desired.push(url);
                }
            }
        }
        self.insert_rows(&rows, undo).await?;

        let fresh = self
            .step("refetch_images", async {
                self.records
                    .list_images(id, &token)
                    .await
                    .map_err(LifecycleError::Persistence)
            })
            .await?;
        let ordered = reconcile_order(&desired, fresh.clone())?;
        self.step("reorder_images", async {
            self.records
                .reorder_images(&ordered)
                .await
                .map_err(LifecycleError::Persistence)
        })
        .await?;
        undo.push(Compensation::RestoreOrder(fresh));

        let cover = ordered.first().map(|row| row.url.clone());
        self.step("set_cover", async {
            self.records
                .set_cover(id, cover.as_deref())
                .await
                .map_err(LifecycleError::Persistence)
        })
        .await?;
        info!(
            target = "emlak.lifecycle",
            listing_id = %id,
            images = ordered.len(),
            removed = removed_paths.len(),
            added = rows.len(),
            "listing updated"
        );
        Ok(removed_paths)
    }

    async fn upload(
        &self,
        listing_id: Uuid,
        position: usize,
        image: &StagedImage,
        undo: &mut Compensations,
    ) -> Result<String, LifecycleError> {
        let path = object_path(listing_id, position, image.extension());
        let url = self
            .step("upload_image", async {
                self.blobs
                    .upload(&path, image.bytes.clone(), &image.content_type)
                    .await
                    .map_err(LifecycleError::Storage)
            })
            .await?;
        undo.push(Compensation::RemoveBlobs(vec![path]));
        Ok(url)
    }

    async fn insert_rows(
        &self,
        rows: &[NewImage],
        undo: &mut Compensations,
    ) -> Result<Vec<ImageRecord>, LifecycleError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let inserted = self
            .step("insert_image_rows", async {
                self.records
                    .insert_images(rows)
                    .await
                    .map_err(LifecycleError::Persistence)
            })
            .await?;
        undo.push(Compensation::DeleteImageRows(
            inserted.iter().map(|row| row.id).collect(),
        ));
        Ok(inserted)
    }

    async fn step<T, Fut>(&self, name: &'static str, fut: Fut) -> Result<T, LifecycleError>
    where
        Fut: Future<Output = Result<T, LifecycleError>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        crate::metrics::stage_elapsed(name, started.elapsed().as_millis());
        if let Err(err) = &outcome {
            warn!(target = "emlak.lifecycle", step = name, error = %err, "step failed");
        }
        outcome
    }

    async fn finish<T, Fut>(&self, flow: &'static str, fut: Fut) -> Result<T, LifecycleError>
    where
        Fut: Future<Output = Result<T, LifecycleError>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        crate::metrics::stage_elapsed(flow, started.elapsed().as_millis());
        match &outcome {
            Ok(_) => self.enter(LifecycleState::Done),
            Err(err) => {
                warn!(
                    target = "emlak.lifecycle",
                    flow,
                    stage = err.stage(),
                    error = %err,
                    "write flow failed"
                );
                self.enter(LifecycleState::Error);
            }
        }
        outcome
    }
}

/// `<listing_id>/<millis>_<position>_<suffix>.<ext>`
fn object_path(listing_id: Uuid, position: usize, extension: &str) -> String {
    let suffix: u32 = rand::rng().random::<u32>() & 0x00ff_ffff;
    format!(
        "{listing_id}/{}_{position}_{suffix:06x}.{extension}",
        Utc::now().timestamp_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SpecLabel, Specs};
    use crate::store::MemoryStore;

    fn manager() -> (ListingManager, MemoryStore) {
        let store = MemoryStore::new("listing-images");
        let records: Arc<dyn RecordStore> = Arc::new(store.clone());
        let blobs: Arc<dyn BlobStore> = Arc::new(store.clone());
        (ListingManager::new(records, blobs), store)
    }

    fn fields() -> ListingFields {
        let mut specs = Specs::default();
        specs.set(SpecLabel::Rooms, "3+1");
        specs.set(SpecLabel::NetArea, "120");
        ListingFields {
            title: "Moda'da bahçeli daire".into(),
            address: "İstanbul / Kadıköy / Moda".into(),
            listing_type: Some(ListingType::ForSale),
            price_line: "2.150.000 TL".into(),
            description: "Denize yürüme mesafesi".into(),
            specs,
        }
    }

    fn photo(tag: u8) -> StagedImage {
        StagedImage {
            bytes: vec![tag; 8],
            content_type: "image/jpeg".into(),
        }
    }

    fn photos(tags: impl IntoIterator<Item = u8>) -> ImageOrder {
        let mut order = ImageOrder::new();
        order.append(tags.into_iter().map(photo));
        order
    }

    fn blob_tag(store: &MemoryStore, url: &str) -> u8 {
        let path = store.path_from_url(url).expect("blob url");
        store.blob(&path).expect("blob stored")[0]
    }

    fn assert_consistent(store: &MemoryStore, id: Uuid) {
        let rows = store.image_rows(id);
        let idx: Vec<i32> = rows.iter().map(|row| row.idx).collect();
        assert_eq!(idx, (0..rows.len() as i32).collect::<Vec<_>>());
        let listing = store.listing(id).expect("listing");
        assert_eq!(listing.cover_url, rows.first().map(|row| row.url.clone()));
        assert_eq!(
            parse_price(&listing.columns.specs.price_line),
            Some(listing.columns.price_tl)
        );
    }

    #[tokio::test]
    async fn create_persists_record_images_and_cover() {
        let (manager, store) = manager();
        let mut order = photos([1, 2, 3]);
        order.promote(2).unwrap();

        let id = manager.create(fields(), order).await.expect("create");

        assert_eq!(manager.state(), LifecycleState::Done);
        let rows = store.image_rows(id);
        let tags: Vec<u8> = rows.iter().map(|row| blob_tag(&store, &row.url)).collect();
        assert_eq!(tags, vec![3, 1, 2]);
        assert!(rows.iter().all(|row| row.url.contains(&id.to_string())));
        assert_eq!(store.blob_paths(&format!("{id}/")).len(), 3);
        assert_consistent(&store, id);
        let listing = store.listing(id).unwrap();
        assert_eq!(listing.columns.price_tl, 2_150_000);
        assert_eq!(listing.columns.city.as_deref(), Some("İstanbul"));
    }

    #[tokio::test]
    async fn create_truncates_to_cap_at_save() {
        let (manager, store) = manager();
        let manager = manager.with_max_images(2);
        let id = manager.create(fields(), photos([1, 2, 3, 4])).await.unwrap();
        assert_eq!(store.image_rows(id).len(), 2);
        assert_eq!(store.blob_paths("").len(), 2);
    }

    #[tokio::test]
    async fn validation_collects_every_problem() {
        let (manager, store) = manager();
        let err = manager
            .create(ListingFields::default(), ImageOrder::new())
            .await
            .expect_err("invalid");
        match err {
            LifecycleError::Validation(problems) => assert_eq!(problems.len(), 6),
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(manager.state(), LifecycleState::Error);
        assert_eq!(store.listing_count(), 0);

        let mut unreadable = fields();
        unreadable.price_line = "Fiyat sorunuz".into();
        let err = validate(&unreadable, &photos([1]), WriteMode::Update).unwrap_err();
        assert!(err.to_string().contains("no readable amount"));
    }

    #[test]
    fn size_label_is_required_only_for_create() {
        let mut no_size = fields();
        no_size.specs = Specs::default();
        assert!(validate(&no_size, &photos([1]), WriteMode::Update).is_ok());
        let err = validate(&no_size, &photos([1]), WriteMode::Create).unwrap_err();
        assert!(err.to_string().contains("room count or area"));
    }

    #[tokio::test]
    async fn failed_create_is_rolled_back_and_error_is_verbatim() {
        let (manager, store) = manager();
        store.fail_on("insert_images");

        let err = manager
            .create(fields(), photos([1, 2]))
            .await
            .expect_err("insert_images fails");

        assert_eq!(err.to_string(), "request failed: insert_images unavailable");
        assert!(matches!(err, LifecycleError::Persistence(_)));
        assert_eq!(store.listing_count(), 0);
        assert!(store.blob_paths("").is_empty());
        assert_eq!(manager.state(), LifecycleState::Error);
    }

    #[tokio::test]
    async fn failed_cover_step_leaves_no_orphans() {
        let (manager, store) = manager();
        store.fail_on("set_cover");
        let err = manager.create(fields(), photos([1, 2])).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Persistence(_)));
        assert_eq!(store.listing_count(), 0);
        assert!(store.blob_paths("").is_empty());
    }

    #[tokio::test]
    async fn failed_upload_is_a_storage_error() {
        let (manager, store) = manager();
        store.fail_on("upload");
        let err = manager.create(fields(), photos([1])).await.unwrap_err();
        assert_eq!(err.stage(), "storage");
        assert_eq!(store.listing_count(), 0);
    }

    #[tokio::test]
    async fn update_with_removals_and_additions_yields_dense_desired_order() {
        let (manager, store) = manager();
        let id = manager.create(fields(), photos([1, 2, 3])).await.unwrap();
        let removed_url = store.image_rows(id)[1].url.clone();
        let removed_path = store.path_from_url(&removed_url).unwrap();

        let mut session = manager.get_for_edit(id).await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Editing);
        assert_eq!(session.fields.price_line, "2.150.000 TL");
        session.order.remove(1).unwrap();
        session.order.append([photo(4), photo(5)]);
        session.order.promote(3).unwrap();
        session.fields.title = "Yeni başlık".into();
        session.fields.price_line = "1.990.000 TL".into();

        manager.update(id, session.fields, session.order).await.unwrap();

        let rows = store.image_rows(id);
        let tags: Vec<u8> = rows.iter().map(|row| blob_tag(&store, &row.url)).collect();
        assert_eq!(tags, vec![5, 1, 3, 4]);
        assert!(store.blob(&removed_path).is_none());
        assert_consistent(&store, id);
        let listing = store.listing(id).unwrap();
        assert_eq!(listing.columns.title, "Yeni başlık");
        assert_eq!(listing.columns.price_tl, 1_990_000);
    }

    #[tokio::test]
    async fn failed_update_restores_previous_state() {
        let (manager, store) = manager();
        let id = manager.create(fields(), photos([1, 2, 3])).await.unwrap();
        let before_rows = store.image_rows(id);
        let before_listing = store.listing(id).unwrap();
        let before_blobs = store.blob_paths("");

        let mut session = manager.get_for_edit(id).await.unwrap();
        session.order.remove(0).unwrap();
        session.order.append([photo(9)]);
        session.order.promote(2).unwrap();
        session.fields.title = "Değişti".into();
        store.fail_on("reorder_images");

        let err = manager
            .update(id, session.fields, session.order)
            .await
            .expect_err("reorder fails");
        assert_eq!(err.to_string(), "request failed: reorder_images unavailable");

        store.recover("reorder_images");
        assert_eq!(store.image_rows(id), before_rows);
        assert_eq!(store.listing(id).unwrap(), before_listing);
        assert_eq!(store.blob_paths(""), before_blobs);
    }

    #[tokio::test]
    async fn failed_blob_cleanup_is_surfaced_after_commit() {
        let (manager, store) = manager();
        let id = manager.create(fields(), photos([1, 2])).await.unwrap();
        let mut session = manager.get_for_edit(id).await.unwrap();
        session.order.remove(0).unwrap();
        store.fail_on("remove");

        let err = manager
            .update(id, session.fields, session.order)
            .await
            .expect_err("blob removal fails");
        assert!(matches!(err, LifecycleError::Storage(_)));
        assert_eq!(store.image_rows(id).len(), 1);
        assert_consistent(&store, id);
    }

    #[tokio::test]
    async fn update_of_missing_listing_is_not_found() {
        let (manager, _store) = manager();
        let missing = Uuid::new_v4();
        let err = manager
            .update(missing, fields(), photos([1]))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn delete_cascades_to_blobs_and_rows() {
        let (manager, store) = manager();
        let keep = manager.create(fields(), photos([7])).await.unwrap();
        let id = manager.create(fields(), photos([1, 2, 3, 4])).await.unwrap();
        assert_eq!(store.blob_paths(&format!("{id}/")).len(), 4);

        manager.delete(id).await.unwrap();

        assert!(store.blob_paths(&format!("{id}/")).is_empty());
        assert!(store.image_rows(id).is_empty());
        assert!(store.listing(id).is_none());
        assert_eq!(store.image_rows(keep).len(), 1);
    }

    #[tokio::test]
    async fn delete_of_missing_listing_is_not_found() {
        let (manager, store) = manager();
        let keep = manager.create(fields(), photos([1])).await.unwrap();
        let missing = Uuid::new_v4();
        let err = manager.delete(missing).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(id) if id == missing));
        assert!(store.listing(keep).is_some());
        assert_eq!(store.blob_paths("").len(), 1);
    }

    #[tokio::test]
    async fn delete_halts_when_blob_removal_fails() {
        let (manager, store) = manager();
        let id = manager.create(fields(), photos([1, 2])).await.unwrap();
        store.fail_on("remove");
        let err = manager.delete(id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Storage(_)));
        assert_eq!(store.image_rows(id).len(), 2);
        assert!(store.listing(id).is_some());
    }

    #[test]
    fn busy_flag_rejects_reentrant_submission() {
        let flag = BusyFlag::default();
        let guard = flag.acquire().expect("first");
        assert!(matches!(flag.acquire(), Err(LifecycleError::Busy)));
        drop(guard);
        assert!(flag.acquire().is_ok());
    }

    #[test]
    fn reconcile_assigns_dense_indices_and_keeps_foreign_rows() {
        let listing_id = Uuid::new_v4();
        let row = |url: &str, idx: i32| ImageRecord {
            id: Uuid::new_v4(),
            listing_id,
            url: url.into(),
            idx,
        };
        let stored = vec![row("a", 0), row("b", 1), row("x", 1), row("c", 5)];
        let ordered =
            reconcile_order(&["c".to_string(), "a".to_string()], stored.clone()).unwrap();
        let urls: Vec<&str> = ordered.iter().map(|row| row.url.as_str()).collect();
        assert_eq!(urls, vec!["c", "a", "b", "x"]);
        assert_eq!(
            ordered.iter().map(|row| row.idx).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        let err = reconcile_order(&["gone".to_string()], stored).unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)));
    }

    #[test]
    fn import_moves_through_editing() {
        let (manager, _store) = manager();
        let imported = manager.import("Oda Sayısı 2+1\n3.000.000 TL\nAnkara / Çankaya");
        assert_eq!(manager.state(), LifecycleState::Editing);
        let fields = fields_from_import(&imported);
        assert_eq!(fields.price_line, "3.000.000 TL");
        assert_eq!(fields.address, "Ankara / Çankaya");
        assert_eq!(fields.specs.get(SpecLabel::Rooms), "2+1");
    }
}
