use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tokio::time::Instant;

use super::{CacheData, CachedValue, SetOptions, Storage, StorageError, StorageOptions};
use crate::caching::cache_key::{function_prefix, namespace_prefix, storage_key};

#[derive(Debug, Clone)]
struct MemoryEntry {
    data: Arc<CacheData>,
    inserted_at: Instant,
    ttl: Duration,
}

impl MemoryEntry {
    fn time_left(&self) -> Duration {
        self.ttl.saturating_sub(self.inserted_at.elapsed())
    }
}

/// Expires every entry after the TTL it was stored with.
struct EntryExpiry;

impl Expiry<String, MemoryEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// An in-process storage backend.
///
/// Entries are kept in a [`moka`] cache without any capacity limit, so they only ever leave the
/// cache once they expire or are deleted. Remaining lifetimes are measured with the tokio clock,
/// which makes them follow a paused clock in tests.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    cache: Cache<String, MemoryEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let cache = Cache::builder()
            .name("memocache")
            .expire_after(EntryExpiry)
            .build();
        Self { cache }
    }

    /// Removes every entry whose key starts with `key_prefix`.
    async fn invalidate_prefixed(&self, key_prefix: &str) -> usize {
        let keys: Vec<_> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(key_prefix))
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.cache.invalidate(key.as_str()).await;
        }
        keys.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(
        &self,
        function_id: &str,
        args_id: &str,
        options: &StorageOptions,
    ) -> Result<Option<CachedValue>, StorageError> {
        let key = storage_key(options.prefix(), function_id, args_id);
        let Some(entry) = self.cache.get(&key).await else {
            return Ok(None);
        };

        let time_left = entry.time_left();
        if time_left.is_zero() {
            self.cache.invalidate(&key).await;
            return Ok(None);
        }
        if entry.data.is_empty() {
            return Ok(None);
        }

        Ok(Some(CachedValue {
            data: entry.data.as_ref().clone(),
            time_left,
        }))
    }

    async fn set(
        &self,
        function_id: &str,
        args_id: &str,
        data: CacheData,
        options: &SetOptions,
    ) -> Result<(), StorageError> {
        let key = storage_key(options.prefix(), function_id, args_id);
        let entry = MemoryEntry {
            data: Arc::new(data),
            inserted_at: Instant::now(),
            ttl: options.ttl,
        };
        self.cache.insert(key, entry).await;
        Ok(())
    }

    async fn delete(
        &self,
        function_id: &str,
        options: &StorageOptions,
    ) -> Result<(), StorageError> {
        let key_prefix = function_prefix(options.prefix(), function_id);
        let deleted = self.invalidate_prefixed(&key_prefix).await;
        tracing::debug!(prefix = %key_prefix, deleted, "deleted memory cache entries");
        Ok(())
    }

    async fn purge(&self, options: &StorageOptions) -> Result<(), StorageError> {
        let key_prefix = match options.prefix() {
            Some(prefix) => namespace_prefix(prefix),
            None => {
                tracing::warn!("purging the whole memory cache");
                String::new()
            }
        };
        let deleted = self.invalidate_prefixed(&key_prefix).await;
        tracing::debug!(prefix = %key_prefix, deleted, "purged memory cache entries");
        Ok(())
    }
}
