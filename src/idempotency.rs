use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

const KEY_PREFIX: &str = "emlak:idempotency:";

/// Remembers responses by `Idempotency-Key`. Redis when configured,
/// otherwise a process-local map. Lookup failures count as misses.
pub struct IdempotencyStore {
    redis: Option<redis::Client>,
    local: Mutex<HashMap<String, (Instant, String)>>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(redis: Option<redis::Client>, ttl_secs: u64) -> Self {
        Self {
            redis,
            local: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs.max(1)),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(client) = &self.redis {
            return redis_get(client, &format!("{KEY_PREFIX}{key}")).await;
        }
        let mut local = self.local.lock().await;
        let ttl = self.ttl;
        local.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        local
            .get(key)
            .and_then(|(_, raw)| serde_json::from_str(raw).ok())
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) {
        if let Some(client) = &self.redis {
            redis_set(client, &format!("{KEY_PREFIX}{key}"), value, self.ttl.as_secs()).await;
            return;
        }
        if let Ok(raw) = serde_json::to_string(value) {
            self.local
                .lock()
                .await
                .insert(key.to_string(), (Instant::now(), raw));
        }
    }
}

pub async fn redis_get<T: DeserializeOwned>(client: &redis::Client, key: &str) -> Option<T> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set<T: Serialize>(client: &redis::Client, key: &str, value: &T, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Created {
        id: u32,
    }

    #[tokio::test]
    async fn local_store_replays_saved_value() {
        let store = IdempotencyStore::new(None, 60);
        assert_eq!(store.get::<Created>("k1").await, None);
        store.set("k1", &Created { id: 7 }).await;
        assert_eq!(store.get::<Created>("k1").await, Some(Created { id: 7 }));
        assert_eq!(store.get::<Created>("k2").await, None);
    }
}
