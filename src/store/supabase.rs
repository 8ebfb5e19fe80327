use super::{BlobStore, RecordStore, StoreError, public_object_url};
use crate::models::{
    ImageRecord, ListOrder, ListQuery, ListingColumns, ListingPage, ListingRecord, NewImage,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

const LISTINGS: &str = "listings";
const LISTING_IMAGES: &str = "listing_images";
const IMAGE_COLUMNS: &str = "id,listing_id,url,idx";

/// Handle to one Supabase project: PostgREST tables plus one Storage bucket.
///
/// Constructed once at startup and shared by the catalog and the lifecycle
/// manager.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    bucket: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: Uuid,
}

impl SupabaseClient {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        bucket: impl Into<String>,
        http: Client,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            bucket: bucket.into(),
            http,
        }
    }

    fn table(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn object(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{path}", self.base_url, self.bucket)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        ensure_success(response).await
    }

    async fn send_cancellable(
        &self,
        request: RequestBuilder,
        token: &CancellationToken,
    ) -> Result<Response, StoreError> {
        tokio::select! {
            _ = token.cancelled() => Err(StoreError::Cancelled),
            response = self.send(request) => response,
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    response
        .json()
        .await
        .map_err(|err| StoreError::Deserialize(err.to_string()))
}

/// Total row count from a `Content-Range: 0-5/42` header.
fn total_from_content_range(value: Option<&str>) -> Option<u64> {
    value?.rsplit_once('/')?.1.trim().parse().ok()
}

fn order_param(order: ListOrder) -> &'static str {
    match order {
        ListOrder::Newest => "created_at.desc.nullslast",
        ListOrder::PriceAsc => "price_tl.asc.nullslast",
        ListOrder::PriceDesc => "price_tl.desc.nullslast",
    }
}

#[async_trait]
impl RecordStore for SupabaseClient {
    async fn list_listings(
        &self,
        query: &ListQuery,
        token: &CancellationToken,
    ) -> Result<ListingPage, StoreError> {
        let (from, to) = query.range();
        let mut params = vec![
            ("select", "*".to_string()),
            ("order", order_param(query.order).to_string()),
        ];
        if let Some(kind) = query.type_filter.listing_type() {
            params.push(("type", format!("eq.{}", kind.as_str())));
        }
        let request = self
            .http
            .get(self.table(LISTINGS))
            .query(&params)
            .header("Range-Unit", "items")
            .header("Range", format!("{from}-{to}"))
            .header("Prefer", "count=exact");
        let response = self.send_cancellable(request, token).await?;
        let total = total_from_content_range(
            response
                .headers()
                .get("content-range")
                .and_then(|value| value.to_str().ok()),
        );
        let items: Vec<ListingRecord> = decode(response).await?;
        let total = total.unwrap_or(items.len() as u64);
        debug!(target = "emlak.supabase", from, to, total, "listings page fetched");
        Ok(ListingPage { items, total })
    }

    async fn get_listing(
        &self,
        id: Uuid,
        token: &CancellationToken,
    ) -> Result<Option<ListingRecord>, StoreError> {
        let request = self.http.get(self.table(LISTINGS)).query(&[
            ("select", "*".to_string()),
            ("id", format!("eq.{id}")),
            ("limit", "1".to_string()),
        ]);
        let response = self.send_cancellable(request, token).await?;
        let mut rows: Vec<ListingRecord> = decode(response).await?;
        Ok(rows.pop())
    }

    async fn list_images(
        &self,
        listing_id: Uuid,
        token: &CancellationToken,
    ) -> Result<Vec<ImageRecord>, StoreError> {
        let request = self.http.get(self.table(LISTING_IMAGES)).query(&[
            ("select", IMAGE_COLUMNS.to_string()),
            ("listing_id", format!("eq.{listing_id}")),
            ("order", "idx.asc".to_string()),
        ]);
        let response = self.send_cancellable(request, token).await?;
        decode(response).await
    }

    async fn insert_listing(&self, columns: &ListingColumns) -> Result<Uuid, StoreError> {
        let mut body =
            serde_json::to_value(columns).map_err(|err| StoreError::Request(err.to_string()))?;
        if let Some(object) = body.as_object_mut() {
            object.insert("cover_url".into(), serde_json::Value::Null);
        }
        let request = self
            .http
            .post(self.table(LISTINGS))
            .query(&[("select", "id")])
            .header("Prefer", "return=representation")
            .json(&body);
        let response = self.send(request).await?;
        let mut rows: Vec<IdRow> = decode(response).await?;
        rows.pop()
            .map(|row| row.id)
            .ok_or_else(|| StoreError::Deserialize("insert returned no row".into()))
    }

    async fn update_listing(&self, id: Uuid, columns: &ListingColumns) -> Result<(), StoreError> {
        let request = self
            .http
            .patch(self.table(LISTINGS))
            .query(&[("id", format!("eq.{id}"))])
            .json(columns);
        self.send(request).await.map(drop)
    }

    async fn set_cover(&self, id: Uuid, cover_url: Option<&str>) -> Result<(), StoreError> {
        let request = self
            .http
            .patch(self.table(LISTINGS))
            .query(&[("id", format!("eq.{id}"))])
            .json(&json!({ "cover_url": cover_url }));
        self.send(request).await.map(drop)
    }

    async fn delete_listing(&self, id: Uuid) -> Result<(), StoreError> {
        let request = self
            .http
            .delete(self.table(LISTINGS))
            .query(&[("id", format!("eq.{id}"))]);
        self.send(request).await.map(drop)
    }

    async fn insert_images(&self, images: &[NewImage]) -> Result<Vec<ImageRecord>, StoreError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let request = self
            .http
            .post(self.table(LISTING_IMAGES))
            .query(&[("select", IMAGE_COLUMNS)])
            .header("Prefer", "return=representation")
            .json(images);
        let response = self.send(request).await?;
        decode(response).await
    }

    async fn delete_images(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let list = ids
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let request = self
            .http
            .delete(self.table(LISTING_IMAGES))
            .query(&[("id", format!("in.({list})"))]);
        self.send(request).await.map(drop)
    }

    async fn reorder_images(&self, images: &[ImageRecord]) -> Result<(), StoreError> {
        if images.is_empty() {
            return Ok(());
        }
        // Bulk upsert on the primary key: one statement for the whole order.
        let request = self
            .http
            .post(self.table(LISTING_IMAGES))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(images);
        self.send(request).await.map(drop)
    }
}

#[async_trait]
impl BlobStore for SupabaseClient {
    fn public_url(&self, path: &str) -> String {
        public_object_url(&self.base_url, &self.bucket, path)
    }

    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let request = self
            .http
            .post(self.object(path))
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes);
        self.send(request).await?;
        Ok(self.public_url(path))
    }

    async fn remove(&self, paths: &[String]) -> Result<(), StoreError> {
        if paths.is_empty() {
            return Ok(());
        }
        let request = self
            .http
            .delete(format!(
                "{}/storage/v1/object/{}",
                self.base_url, self.bucket
            ))
            .json(&json!({ "prefixes": paths }));
        self.send(request).await.map(drop)
    }
}
