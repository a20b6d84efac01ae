//! Storage backends for cached results.
//!
//! The controller only ever talks to a backend through the four operations of the [`Storage`]
//! trait. Entries are addressed by `(prefix, function_id, args_id)` and expire on their own after
//! the TTL they were stored with. How that happens is up to the backend.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::StorageConfig;

mod memory;
mod redis;

pub use self::memory::MemoryStorage;
pub use self::redis::{RedisStorage, RemoteEntry, RemoteStore};

/// The ordered sequence of result values stored for one call.
pub type CacheData = Vec<Value>;

/// A shared handle to a storage backend.
pub type StorageRef = Arc<dyn Storage>;

/// A hit returned by [`Storage::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    /// The stored values, never empty.
    pub data: CacheData,
    /// Time until the entry expires.
    ///
    /// Entries that never expire report [`Duration::MAX`].
    pub time_left: Duration,
}

/// Options scoping a storage operation to a namespace.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    pub prefix: Option<Arc<str>>,
}

impl StorageOptions {
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// Options for [`Storage::set`].
#[derive(Debug, Clone)]
pub struct SetOptions {
    pub prefix: Option<Arc<str>>,
    pub ttl: Duration,
}

impl SetOptions {
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// Errors reported by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to encode cache entry")]
    Encode(#[from] serde_json::Error),
    #[error("redis command failed")]
    Redis(#[from] ::redis::RedisError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A key-value store holding cached results.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// A short name of the backend, used in logs.
    fn name(&self) -> &'static str;

    /// Looks up the entry of one call.
    ///
    /// Returns `Ok(None)` on a miss, including entries that hold no values.
    async fn get(
        &self,
        function_id: &str,
        args_id: &str,
        options: &StorageOptions,
    ) -> Result<Option<CachedValue>, StorageError>;

    /// Stores the values of one call, expiring `options.ttl` from now.
    async fn set(
        &self,
        function_id: &str,
        args_id: &str,
        data: CacheData,
        options: &SetOptions,
    ) -> Result<(), StorageError>;

    /// Removes all entries of `function_id`, regardless of their arguments.
    async fn delete(&self, function_id: &str, options: &StorageOptions)
    -> Result<(), StorageError>;

    /// Removes all entries in the namespace given by `options.prefix`.
    ///
    /// Without a prefix, this wipes every entry the backend can reach.
    async fn purge(&self, options: &StorageOptions) -> Result<(), StorageError>;
}

impl fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Storage").field(&self.name()).finish()
    }
}

/// Creates the storage backend described by `config`.
pub async fn from_config(config: &StorageConfig) -> Result<StorageRef, StorageError> {
    let storage: StorageRef = match config {
        StorageConfig::Memory => Arc::new(MemoryStorage::new()),
        StorageConfig::Redis(config) => {
            Arc::new(RedisStorage::connect(&config.url, config.scan_count).await?)
        }
    };
    tracing::debug!(backend = storage.name(), "created cache storage");
    Ok(storage)
}
