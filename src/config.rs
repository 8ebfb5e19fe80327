use crate::images::MAX_PERSIST_IMAGES;
use eyre::{Result, WrapErr};
use serde::Deserialize;
use std::{env, fs, path::PathBuf};
use tracing::{info, warn};

pub const DEFAULT_BUCKET: &str = "listing-images";

/// Service settings. Defaults, then the optional YAML file named by
/// `LISTINGS_CONFIG`, then environment variables.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub request_max_bytes: usize,
    pub http_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,
    pub supabase: Option<SupabaseConfig>,
    pub listing_bucket: String,
    pub max_persist_images: usize,
    pub cache_dir: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub idempotency_ttl_secs: u64,
    pub metrics_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_key: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            request_max_bytes: 32 * 1024 * 1024,
            http_timeout_secs: 15,
            http_connect_timeout_secs: 5,
            supabase: None,
            listing_bucket: DEFAULT_BUCKET.to_string(),
            max_persist_images: MAX_PERSIST_IMAGES,
            cache_dir: None,
            redis_url: None,
            idempotency_ttl_secs: 3600,
            metrics_key: None,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        if let Err(err) = dotenvy::dotenv()
            && !err.not_found()
        {
            warn!(target = "emlak.config", error = %err, "ignored unreadable .env file");
        }
        let mut config = match env::var("LISTINGS_CONFIG") {
            Ok(path) if !path.trim().is_empty() => {
                let raw = fs::read_to_string(path.trim())
                    .wrap_err_with(|| format!("reading config file {path}"))?;
                let config = Self::from_yaml(&raw)
                    .wrap_err_with(|| format!("parsing config file {path}"))?;
                info!(target = "emlak.config", path = %path, "loaded config file");
                config
            }
            _ => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Overrides fields from `lookup`; unparsable numbers keep the current
    /// value.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(port) = get("PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(limit) = get("REQUEST_MAX_BYTES")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            self.request_max_bytes = limit;
        }
        if let Some(secs) = get("HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_timeout_secs = secs;
        }
        if let Some(secs) = get("HTTP_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_connect_timeout_secs = secs;
        }
        if let Some(cap) = get("MAX_PERSIST_IMAGES")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            self.max_persist_images = cap;
        }
        if let Some(ttl) = get("IDEMPOTENCY_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.idempotency_ttl_secs = ttl;
        }
        if let Some(bucket) = get("LISTING_BUCKET") {
            self.listing_bucket = bucket;
        }
        if let Some(dir) = get("CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = get("REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(key) = get("METRICS_KEY") {
            self.metrics_key = Some(key);
        }

        let url = get("SUPABASE_URL");
        let key = get("SUPABASE_SERVICE_ROLE_KEY").or_else(|| get("SUPABASE_KEY"));
        match (url, key) {
            (Some(url), Some(service_key)) => {
                self.supabase = Some(SupabaseConfig {
                    url: url.trim_end_matches('/').to_string(),
                    service_key,
                });
            }
            (Some(_), None) | (None, Some(_)) => warn!(
                target = "emlak.config",
                "SUPABASE_URL and a service key must both be set; ignoring partial settings"
            ),
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let mut config = AppConfig::default();
        config.apply_env(lookup(&[
            ("PORT", "9090"),
            ("MAX_PERSIST_IMAGES", "12"),
            ("REQUEST_MAX_BYTES", "not-a-number"),
            ("SUPABASE_URL", "https://abc.supabase.co/"),
            ("SUPABASE_KEY", "service"),
        ]));
        assert_eq!(config.port, 9090);
        assert_eq!(config.max_persist_images, 12);
        assert_eq!(config.request_max_bytes, AppConfig::default().request_max_bytes);
        let supabase = config.supabase.expect("supabase configured");
        assert_eq!(supabase.url, "https://abc.supabase.co");
        assert_eq!(supabase.service_key, "service");
    }

    #[test]
    fn partial_supabase_settings_are_ignored() {
        let mut config = AppConfig::default();
        config.apply_env(lookup(&[("SUPABASE_URL", "https://abc.supabase.co")]));
        assert!(config.supabase.is_none());
    }

    #[test]
    fn yaml_overlay_keeps_unset_defaults() {
        let config = AppConfig::from_yaml(
            "port: 7000\nlisting_bucket: photos\ncache_dir: /tmp/emlak\n",
        )
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.listing_bucket, "photos");
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/emlak")));
        assert_eq!(config.max_persist_images, MAX_PERSIST_IMAGES);
    }
}
