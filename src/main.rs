mod cache;
mod catalog;
mod config;
mod fetch;
mod http;
mod idempotency;
mod images;
mod importer;
mod lifecycle;
mod metrics;
mod models;
mod routes;
mod security;
mod store;

use cache::FeaturedCache;
use catalog::Catalog;
use config::AppConfig;
use eyre::WrapErr;
use idempotency::IdempotencyStore;
use images::CompressOptions;
use lifecycle::ListingManager;
use metrics_exporter_prometheus::PrometheusBuilder;
use routes::AppState;
use security::AdminState;
use std::{net::SocketAddr, sync::Arc};
use store::{BlobStore, MemoryStore, RecordStore, SupabaseClient};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "emlak.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let config = AppConfig::load()?;
    let http = http::build_client(&config);

    let (records, blobs): (Arc<dyn RecordStore>, Arc<dyn BlobStore>) = match &config.supabase {
        Some(supabase) => {
            let client = Arc::new(SupabaseClient::new(
                &supabase.url,
                &supabase.service_key,
                &config.listing_bucket,
                http.clone(),
            ));
            info!(
                target = "emlak.api",
                url = %supabase.url,
                bucket = %config.listing_bucket,
                "using Supabase store"
            );
            (client.clone() as Arc<dyn RecordStore>, client as Arc<dyn BlobStore>)
        }
        None => {
            warn!(
                target = "emlak.api",
                "SUPABASE_URL not configured; listings are kept in memory"
            );
            let store = Arc::new(MemoryStore::new(&config.listing_bucket));
            (store.clone() as Arc<dyn RecordStore>, store as Arc<dyn BlobStore>)
        }
    };

    let cache = match &config.cache_dir {
        Some(dir) => FeaturedCache::persistent(dir),
        None => FeaturedCache::in_memory(),
    };
    let redis = config
        .redis_url
        .as_deref()
        .and_then(|url| redis::Client::open(url).ok());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing Prometheus recorder")?;

    let state = AppState {
        catalog: Catalog::new(records.clone(), Arc::new(cache)),
        manager: Arc::new(
            ListingManager::new(records, blobs).with_max_images(config.max_persist_images),
        ),
        http,
        compress: CompressOptions::default(),
        idempotency: Arc::new(IdempotencyStore::new(redis, config.idempotency_ttl_secs)),
        prometheus_handle: Some(prometheus_handle),
        metrics_key: config.metrics_key.clone(),
    };
    let app = routes::router(state, AdminState::from_env(), config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "emlak.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
