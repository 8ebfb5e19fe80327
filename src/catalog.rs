use crate::cache::FeaturedCache;
use crate::fetch::{FetchError, RetryPolicy, retrying_call};
use crate::importer::size_label;
use crate::models::{
    ImageView, ListOrder, ListQuery, ListingPage, ListingRecord, TypeFilter, format_price,
};
use crate::store::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub const FEATURED_COUNT: u32 = 6;
const SEARCH_PAGE_SIZE: u32 = 200;
const SEARCH_MAX_PAGES: u32 = 50;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Fetch(#[from] FetchError<StoreError>),
    #[error("listing {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingDetail {
    #[serde(flatten)]
    pub record: ListingRecord,
    pub price_label: String,
    pub size_label: String,
    pub images: Vec<ImageView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeaturedListings {
    pub items: Vec<ListingRecord>,
    /// Served from the local cache; a refresh may still be running.
    #[serde(default)]
    pub stale: bool,
}

/// Read side of the listings store. Every network read goes through the
/// retry policy; the featured set is additionally backed by the local cache.
#[derive(Clone)]
pub struct Catalog {
    records: Arc<dyn RecordStore>,
    cache: Arc<FeaturedCache>,
    policy: RetryPolicy,
    refreshing: Arc<AtomicBool>,
}

impl Catalog {
    pub fn new(records: Arc<dyn RecordStore>, cache: Arc<FeaturedCache>) -> Self {
        Self {
            records,
            cache,
            policy: RetryPolicy::default(),
            refreshing: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn list_page(&self, query: &ListQuery) -> Result<ListingPage, CatalogError> {
        self.read("list_page", |token| async move {
            self.records.list_listings(query, &token).await
        })
        .await
    }

    pub async fn list_images(&self, listing_id: Uuid) -> Result<Vec<ImageView>, CatalogError> {
        let rows = self
            .read("list_images", |token| async move {
                self.records.list_images(listing_id, &token).await
            })
            .await?;
        Ok(rows.into_iter().map(ImageView::from).collect())
    }

    pub async fn get_listing(&self, id: Uuid) -> Result<ListingDetail, CatalogError> {
        let record = self
            .read("get_listing", |token| async move {
                self.records.get_listing(id, &token).await
            })
            .await?
            .ok_or(CatalogError::NotFound(id))?;
        let images = self.list_images(id).await?;
        Ok(ListingDetail {
            price_label: format_price(record.columns.price_tl),
            size_label: size_label(&record.columns.specs),
            record,
            images,
        })
    }

    /// Last cached featured set, without touching the network.
    pub fn featured_cached(&self) -> Option<Vec<ListingRecord>> {
        self.cache.load()
    }

    /// Serves the cached featured set right away and revalidates it in the
    /// background. Only a cold cache waits for the network.
    pub async fn featured(&self) -> Result<FeaturedListings, CatalogError> {
        if let Some(items) = self.featured_cached() {
            self.spawn_refresh();
            return Ok(FeaturedListings { items, stale: true });
        }
        let items = self.refresh_featured().await?;
        Ok(FeaturedListings {
            items,
            stale: false,
        })
    }

    /// Fetches the newest listings and overwrites the cache on success.
    pub async fn refresh_featured(&self) -> Result<Vec<ListingRecord>, CatalogError> {
        let query = ListQuery {
            page: 1,
            page_size: FEATURED_COUNT,
            order: ListOrder::Newest,
            type_filter: TypeFilter::All,
        };
        let page = self.list_page(&query).await?;
        self.cache.save(&page.items).await;
        Ok(page.items)
    }

    fn spawn_refresh(&self) {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let catalog = self.clone();
        tokio::spawn(async move {
            match catalog.refresh_featured().await {
                Ok(items) => debug!(
                    target = "emlak.catalog",
                    count = items.len(),
                    "featured cache revalidated"
                ),
                Err(err) => warn!(
                    target = "emlak.catalog",
                    error = %err,
                    "featured revalidation failed, keeping cached set"
                ),
            }
            catalog.refreshing.store(false, Ordering::Release);
        });
    }

    /// Admin listing filter: every listing, newest first, narrowed by type
    /// and by a case-insensitive term over title and address parts.
    pub async fn search(
        &self,
        term: &str,
        type_filter: TypeFilter,
    ) -> Result<Vec<ListingRecord>, CatalogError> {
        let mut rows = Vec::new();
        for page in 1..=SEARCH_MAX_PAGES {
            let query = ListQuery {
                page,
                page_size: SEARCH_PAGE_SIZE,
                order: ListOrder::Newest,
                type_filter,
            };
            let batch = self.list_page(&query).await?;
            let fetched = batch.items.len();
            rows.extend(batch.items);
            if fetched < SEARCH_PAGE_SIZE as usize || rows.len() as u64 >= batch.total {
                break;
            }
        }
        let needle = term.trim().to_lowercase();
        rows.retain(|row| matches_term(row, &needle));
        Ok(rows)
    }

    async fn read<T, F, Fut>(&self, what: &'static str, op: F) -> Result<T, CatalogError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let outcome = retrying_call(&self.policy, op).await;
        crate::metrics::stage_elapsed(what, started.elapsed().as_millis());
        outcome.map_err(CatalogError::from)
    }
}

/// `needle` must already be trimmed and lowercased.
fn matches_term(row: &ListingRecord, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    let columns = &row.columns;
    let haystack = [
        Some(columns.title.as_str()),
        Some(columns.address.as_str()),
        columns.city.as_deref(),
        columns.district.as_deref(),
        columns.neighborhood.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase();
    haystack.contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ListingColumns, ListingFields, ListingType, NewImage};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            retries: 1,
            base_timeout: Duration::from_millis(200),
            timeout_step: Duration::ZERO,
            base_delay: Duration::from_millis(10),
        }
    }

    fn catalog(store: &MemoryStore) -> Catalog {
        let records: Arc<dyn RecordStore> = Arc::new(store.clone());
        Catalog::new(records, Arc::new(FeaturedCache::in_memory())).with_policy(quick_policy())
    }

    async fn seed(store: &MemoryStore, title: &str, address: &str, kind: ListingType) -> Uuid {
        let fields = ListingFields {
            title: title.into(),
            address: address.into(),
            listing_type: Some(kind),
            price_line: "1.250.000 TL".into(),
            ..Default::default()
        };
        store
            .insert_listing(&ListingColumns::from_fields(&fields, kind))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn detail_carries_labels_and_ordered_images() {
        let store = MemoryStore::new("listing-images");
        let id = seed(&store, "Daire", "İzmir / Bornova", ListingType::ForSale).await;
        let rows: Vec<NewImage> = [(2, "c"), (0, "a"), (1, "b")]
            .into_iter()
            .map(|(idx, name)| NewImage {
                id: None,
                listing_id: id,
                url: format!("https://cdn/{name}.jpeg"),
                idx,
            })
            .collect();
        store.insert_images(&rows).await.unwrap();

        let detail = catalog(&store).get_listing(id).await.unwrap();
        assert_eq!(detail.price_label, "1.250.000 TL");
        let urls: Vec<&str> = detail.images.iter().map(|image| image.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://cdn/a.jpeg", "https://cdn/b.jpeg", "https://cdn/c.jpeg"]
        );
    }

    #[tokio::test]
    async fn unknown_listing_is_not_found() {
        let store = MemoryStore::new("listing-images");
        let err = catalog(&store).get_listing(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_reads_exhaust_retries_then_surface() {
        let store = MemoryStore::new("listing-images");
        store.fail_on("list_listings");
        let err = catalog(&store)
            .list_page(&ListQuery::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "request failed: list_listings unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn featured_falls_back_to_cached_rows() {
        let store = MemoryStore::new("listing-images");
        for n in 0..8 {
            seed(&store, &format!("ilan {n}"), "Ankara / Çankaya", ListingType::ForRent).await;
        }
        let catalog = catalog(&store);
        assert!(catalog.featured_cached().is_none());

        let fresh = catalog.featured().await.unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.items.len(), FEATURED_COUNT as usize);

        store.fail_on("list_listings");
        let cached = catalog.featured().await.unwrap();
        assert!(cached.stale);
        assert_eq!(cached.items, fresh.items);
        assert_eq!(catalog.featured_cached(), Some(fresh.items));
    }

    #[tokio::test(start_paused = true)]
    async fn cold_cache_with_failing_store_is_an_error() {
        let store = MemoryStore::new("listing-images");
        store.fail_on("list_listings");
        assert!(catalog(&store).featured().await.is_err());
    }

    #[tokio::test]
    async fn search_matches_address_parts_case_insensitively() {
        let store = MemoryStore::new("listing-images");
        seed(&store, "Deniz manzaralı", "İzmir / Karşıyaka / Bostanlı", ListingType::ForSale).await;
        seed(&store, "Bahçe katı", "Ankara / Çankaya", ListingType::ForRent).await;
        seed(&store, "Dubleks", "İzmir / Bornova", ListingType::ForRent).await;
        let catalog = catalog(&store);

        let hits = catalog.search("  Bostan ", TypeFilter::All).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].columns.title, "Deniz manzaralı");

        let rentals = catalog.search("", TypeFilter::ForRent).await.unwrap();
        assert_eq!(rentals.len(), 2);

        let none = catalog.search("bornova", TypeFilter::ForSale).await.unwrap();
        assert!(none.is_empty());
    }
}
