use serde::{Serialize, de::DeserializeOwned};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};
use tracing::debug;

pub const FEATURED_CACHE_KEY: &str = "featured-cache-v1";

/// Single-slot store for the last good featured-listings payload.
///
/// Reads are synchronous and never touch the network, so a caller can serve
/// the last known result while a refresh is still running. The slot is
/// mirrored to `<dir>/featured-cache-v1.json` when a directory is configured.
/// Every failure is treated as a miss.
#[derive(Debug, Default)]
pub struct FeaturedCache {
    slot: RwLock<Option<String>>,
    file: Option<PathBuf>,
}

impl FeaturedCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the cache file under `dir`, picking up whatever a previous
    /// process left there.
    pub fn persistent(dir: impl AsRef<Path>) -> Self {
        let file = dir.as_ref().join(format!("{FEATURED_CACHE_KEY}.json"));
        let existing = fs::read_to_string(&file).ok();
        Self {
            slot: RwLock::new(existing),
            file: Some(file),
        }
    }

    /// Replaces the slot immediately, then mirrors it to the cache file
    /// without blocking the runtime.
    pub async fn save<T: Serialize>(&self, payload: &T) {
        let raw = match serde_json::to_string(payload) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(target = "emlak.cache", error = %err, "featured cache not serialized");
                return;
            }
        };
        if let Ok(mut slot) = self.slot.write() {
            *slot = Some(raw.clone());
        }
        if let Some(file) = &self.file
            && let Err(err) = mirror(file, raw).await
        {
            debug!(target = "emlak.cache", error = %err, "featured cache not persisted");
        }
    }

    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let slot = self.slot.read().ok()?;
        let raw = slot.as_deref()?;
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(target = "emlak.cache", error = %err, "featured cache unreadable");
                None
            }
        }
    }
}

async fn mirror(file: &Path, raw: String) -> std::io::Result<()> {
    if let Some(dir) = file.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(file, raw).await
}
