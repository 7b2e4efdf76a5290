//! In-process cache backend.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheBackend, CacheError, MAX_TTL_SECS};

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: String,
    expires_at: Instant,
}

/// Cache held in a `HashMap`; expired entries are dropped lazily on write.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.payload.clone()))
    }

    async fn set(&self, key: &str, payload: &str, ttl_seconds: u64) -> Result<(), CacheError> {
        let now = Instant::now();
        let ttl = Duration::from_secs(ttl_seconds.min(MAX_TTL_SECS));
        let expires_at = now.checked_add(ttl).ok_or_else(|| {
            CacheError::Unavailable(format!("ttl of {ttl_seconds}s overflows the clock"))
        })?;
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                payload: payload.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let prefix = prefix.strip_suffix('*').unwrap_or(prefix);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_reads_back() {
        let cache = MemoryCache::new();
        cache.set("indicators:info:a", "{}", 60).await.unwrap();
        assert_eq!(cache.get("indicators:info:a").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(cache.get("indicators:info:b").await.unwrap(), None);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let cache = MemoryCache::new();
        cache.set("k", "v", 0).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn huge_ttl_is_clamped() {
        let cache = MemoryCache::new();
        cache.set("k", "v", u64::MAX).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn deletes_by_prefix_with_optional_glob() {
        let cache = MemoryCache::new();
        for key in ["indicators:info:a", "indicators:info:b", "indicators:geii:a"] {
            cache.set(key, "1", 60).await.unwrap();
        }
        assert_eq!(cache.delete_prefix("indicators:info:*").await.unwrap(), 2);
        assert_eq!(cache.delete_prefix("indicators:info:").await.unwrap(), 0);
        assert_eq!(cache.len().await, 1);
    }
}
