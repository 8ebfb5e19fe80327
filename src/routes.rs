use crate::catalog::{Catalog, CatalogError, FeaturedListings, ListingDetail};
use crate::idempotency::IdempotencyStore;
use crate::images::{self, CompressOptions, ImageError, ImageOrder, ImageSlot, ImageSource, StagedImage};
use crate::importer::size_label;
use crate::lifecycle::{LifecycleError, ListingManager, fields_from_import};
use crate::models::{
    ApiError, ImageRecord, ImageView, ListQuery, ListingFields, ListingPage, ListingRecord,
    TypeFilter,
};
use crate::security::{AdminContext, AdminState, require_admin};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub manager: Arc<ListingManager>,
    pub http: Client,
    pub compress: CompressOptions,
    pub idempotency: Arc<IdempotencyStore>,
    pub prometheus_handle: Option<PrometheusHandle>,
    pub metrics_key: Option<String>,
}

pub fn router(state: AppState, admin: AdminState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/import", post(import_text))
        .route("/listings", post(create_listing))
        .route(
            "/listings/{id}",
            axum::routing::put(update_listing).delete(delete_listing),
        )
        .route("/admin/listings", get(search_listings))
        .route("/admin/listings/{id}", get(edit_listing))
        .route_layer(middleware::from_fn_with_state(admin, require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/listings", get(list_listings))
        .route("/listings/{id}", get(get_listing))
        .route("/listings/{id}/images", get(listing_images))
        .route("/featured", get(featured))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "emlak-listings",
        "lifecycle": state.manager.state(),
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state
        .prometheus_handle
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn list_listings(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListingPage>, AppError> {
    crate::metrics::inc_requests("/listings");
    Ok(Json(state.catalog.list_page(&query).await?))
}

async fn get_listing(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ListingDetail>, AppError> {
    crate::metrics::inc_requests("/listings/{id}");
    Ok(Json(state.catalog.get_listing(id).await?))
}

async fn listing_images(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ImageView>>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/images");
    Ok(Json(state.catalog.list_images(id).await?))
}

async fn featured(State(state): State<AppState>) -> Result<Json<FeaturedListings>, AppError> {
    crate::metrics::inc_requests("/featured");
    Ok(Json(state.catalog.featured().await?))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    recognized: bool,
    size_label: String,
    fields: ListingFields,
}

/// Turns pasted listing text into pre-filled editor fields. Never fails on
/// unrecognised text; `recognized` is false instead.
async fn import_text(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> Json<ImportResponse> {
    crate::metrics::inc_requests("/import");
    let imported = state.manager.import(&request.text);
    Json(ImportResponse {
        recognized: !imported.is_empty(),
        size_label: size_label(&imported.specs),
        fields: fields_from_import(&imported),
    })
}

/// One entry of the requested photo order.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImageInput {
    /// A photo the listing already has.
    Stored { id: Uuid },
    /// Base64 or `data:` URL of a newly selected file.
    Upload { data: String },
    Remote { url: String },
}

#[derive(Debug, Deserialize)]
struct ListingPayload {
    #[serde(flatten)]
    fields: ListingFields,
    #[serde(default)]
    images: Vec<ImageInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct SavedListing {
    id: Uuid,
}

#[derive(Debug, Serialize)]
struct EditView {
    id: Uuid,
    fields: ListingFields,
    size_label: String,
    cover_url: Option<String>,
    created_at: DateTime<Utc>,
    images: Vec<ImageRecord>,
}

#[derive(Debug, Clone, PartialEq)]
enum RequestedImage {
    Stored(Uuid),
    Staged(StagedImage),
}

async fn create_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AdminContext>,
    headers: HeaderMap,
    Json(payload): Json<ListingPayload>,
) -> Result<(StatusCode, Json<SavedListing>), AppError> {
    crate::metrics::inc_requests("POST /listings");
    let key = idempotency_key(&headers);
    if let Some(key) = &key
        && let Some(existing) = state.idempotency.get::<SavedListing>(key).await
    {
        return Ok((StatusCode::OK, Json(existing)));
    }

    let requested = stage_inputs(&state, payload.images).await?;
    let order = arrange(ImageOrder::new(), requested)?;
    let id = state.manager.create(payload.fields, order).await?;
    info!(
        target = "emlak.api",
        admin = %context.admin,
        api_key = %context.api_key_id,
        listing_id = %id,
        "listing created"
    );

    let saved = SavedListing { id };
    if let Some(key) = &key {
        state.idempotency.set(key, &saved).await;
    }
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn update_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AdminContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ListingPayload>,
) -> Result<Json<SavedListing>, AppError> {
    crate::metrics::inc_requests("PUT /listings/{id}");
    let session = state.manager.get_for_edit(id).await?;
    let requested = stage_inputs(&state, payload.images).await?;
    let order = arrange(session.order, requested)?;
    let dropped_photos = order.pending_deletions().len();
    state.manager.update(id, payload.fields, order).await?;
    info!(
        target = "emlak.api",
        admin = %context.admin,
        listing_id = %id,
        dropped_photos,
        "listing updated"
    );
    Ok(Json(SavedListing { id }))
}

async fn delete_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AdminContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    crate::metrics::inc_requests("DELETE /listings/{id}");
    state.manager.delete(id).await?;
    info!(
        target = "emlak.api",
        admin = %context.admin,
        listing_id = %id,
        "listing deleted"
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn edit_listing(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EditView>, AppError> {
    let session = state.manager.get_for_edit(id).await?;
    let cover_url = match session.order.cover() {
        Some(ImageSlot::Persisted { url, .. }) => Some(url.clone()),
        _ => session.record.cover_url.clone(),
    };
    Ok(Json(EditView {
        id,
        size_label: size_label(&session.fields.specs),
        cover_url,
        created_at: session.record.created_at,
        fields: session.fields,
        images: session.images,
    }))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    #[serde(rename = "type", default)]
    type_filter: TypeFilter,
}

async fn search_listings(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<ListingRecord>>, AppError> {
    crate::metrics::inc_requests("/admin/listings");
    Ok(Json(state.catalog.search(&query.q, query.type_filter).await?))
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn stage_inputs(
    state: &AppState,
    inputs: Vec<ImageInput>,
) -> Result<Vec<RequestedImage>, AppError> {
    // `None` marks where the next staged photo goes.
    let mut requested = Vec::with_capacity(inputs.len());
    let mut sources = Vec::new();
    for input in inputs {
        match input {
            ImageInput::Stored { id } => {
                requested.push(Some(RequestedImage::Stored(id)));
                continue;
            }
            ImageInput::Upload { data } => {
                let (bytes, content_type) = StagedImage::decode_payload(&data)?;
                sources.push(ImageSource::Bytes {
                    bytes,
                    content_type,
                });
            }
            ImageInput::Remote { url } => sources.push(ImageSource::Url(url)),
        }
        requested.push(None);
    }
    let mut staged = images::stage_all(&state.http, sources, state.compress)
        .await?
        .into_iter();
    Ok(requested
        .into_iter()
        .filter_map(|item| item.or_else(|| staged.next().map(RequestedImage::Staged)))
        .collect())
}

/// Rearranges `order` into the requested photo sequence. Stored photos left
/// out of the request are queued for deletion.
fn arrange(
    mut order: ImageOrder,
    requested: Vec<RequestedImage>,
) -> Result<ImageOrder, AppError> {
    let known: HashSet<Uuid> = order
        .slots()
        .iter()
        .filter_map(|slot| match slot {
            ImageSlot::Persisted { id, .. } => Some(*id),
            ImageSlot::Staged(_) => None,
        })
        .collect();
    let mut wanted = Vec::with_capacity(requested.len());
    for item in requested {
        if let RequestedImage::Stored(id) = &item
            && !known.contains(id)
        {
            return Err(AppError::BadRequest(format!(
                "image {id} does not belong to this listing"
            )));
        }
        if !wanted.contains(&item) {
            wanted.push(item);
        }
    }

    for index in (0..order.len()).rev() {
        if let ImageSlot::Persisted { id, .. } = &order.slots()[index]
            && !wanted.contains(&RequestedImage::Stored(*id))
        {
            order.remove(index)?;
        }
    }
    order.append(wanted.iter().filter_map(|item| match item {
        RequestedImage::Staged(image) => Some(image.clone()),
        RequestedImage::Stored(_) => None,
    }));

    // Promoting from the last wanted photo to the first leaves them in
    // request order.
    for item in wanted.iter().rev() {
        let index = order
            .slots()
            .iter()
            .position(|slot| match (slot, item) {
                (ImageSlot::Persisted { id, .. }, RequestedImage::Stored(wanted)) => id == wanted,
                (ImageSlot::Staged(image), RequestedImage::Staged(wanted)) => image == wanted,
                _ => false,
            })
            .ok_or_else(|| AppError::BadRequest("image order could not be resolved".into()))?;
        order.promote(index)?;
    }
    Ok(order)
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("{0}")]
    BadRequest(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Lifecycle(LifecycleError::Validation(_)) => StatusCode::BAD_REQUEST,
            AppError::Lifecycle(LifecycleError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Lifecycle(LifecycleError::Busy | LifecycleError::Conflict(_)) => {
                StatusCode::CONFLICT
            }
            AppError::Lifecycle(_) => StatusCode::BAD_GATEWAY,
            AppError::Catalog(CatalogError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Catalog(CatalogError::Fetch(err)) if err.is_timeout() => {
                StatusCode::GATEWAY_TIMEOUT
            }
            AppError::Catalog(_) => StatusCode::BAD_GATEWAY,
            AppError::Image(ImageError::Download(_)) => StatusCode::BAD_GATEWAY,
            AppError::Image(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Lifecycle(err) => err.stage(),
            AppError::Catalog(CatalogError::NotFound(_)) => "not_found",
            AppError::Catalog(_) => "fetch",
            AppError::Image(_) => "image",
            AppError::BadRequest(_) => "invalid_input",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(target = "emlak.api", status = status.as_u16(), error = %self, "request failed");
        }
        let payload = ApiError {
            error: self.code().to_string(),
            detail: Some(self.to_string()),
        };
        (status, Json(payload)).into_response()
    }
}
