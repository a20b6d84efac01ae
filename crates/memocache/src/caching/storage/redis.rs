use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisResult};
use async_trait::async_trait;

use super::{CacheData, CachedValue, SetOptions, Storage, StorageError, StorageOptions};
use crate::caching::cache_key::{function_prefix, namespace_prefix, storage_key};

/// How often a failed batch delete is retried before the whole operation fails.
const MAX_BATCH_RETRIES: usize = 2;

/// The raw state of a single key, as returned by [`RemoteStore::fetch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteEntry {
    /// The stored payload, `None` if the key does not exist.
    pub value: Option<String>,
    /// The remaining lifetime in milliseconds, as reported by `PTTL`.
    ///
    /// `-1` means the key never expires, `-2` that it does not exist.
    pub pttl: i64,
}

/// The handful of redis commands [`RedisStorage`] is built on.
#[async_trait]
pub trait RemoteStore: Clone + Send + Sync + 'static {
    /// Runs `GET` and `PTTL` for `key` in one round trip.
    async fn fetch(&mut self, key: &str) -> RedisResult<RemoteEntry>;

    /// Runs `SET key value PX ttl_ms`.
    async fn set_px(&mut self, key: &str, value: String, ttl_ms: u64) -> RedisResult<()>;

    /// Runs `SCAN cursor MATCH pattern COUNT count` and returns the next cursor and the keys.
    async fn scan(&mut self, cursor: u64, pattern: &str, count: usize)
    -> RedisResult<(u64, Vec<String>)>;

    /// Runs `DEL` for all `keys`.
    async fn del(&mut self, keys: Vec<String>) -> RedisResult<()>;
}

#[async_trait]
impl RemoteStore for MultiplexedConnection {
    async fn fetch(&mut self, key: &str) -> RedisResult<RemoteEntry> {
        let (value, pttl): (Option<String>, i64) = ::redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(self)
            .await?;
        Ok(RemoteEntry { value, pttl })
    }

    async fn set_px(&mut self, key: &str, value: String, ttl_ms: u64) -> RedisResult<()> {
        let () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(self)
            .await?;
        Ok(())
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> RedisResult<(u64, Vec<String>)> {
        let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(self)
            .await?;
        Ok((next, keys))
    }

    async fn del(&mut self, keys: Vec<String>) -> RedisResult<()> {
        let _deleted: i64 = ::redis::cmd("DEL").arg(keys).query_async(self).await?;
        Ok(())
    }
}

/// A storage backend on top of a redis server.
///
/// Values are stored as JSON arrays with a millisecond expiry. Redis has no way of listing keys
/// by prefix, so [`delete`](Storage::delete) and [`purge`](Storage::purge) walk the keyspace with
/// `SCAN` and delete each batch of matching keys as it comes in.
#[derive(Debug, Clone)]
pub struct RedisStorage<C = MultiplexedConnection> {
    conn: C,
    scan_count: usize,
}

impl RedisStorage {
    /// Connects to the redis server at `url`.
    pub async fn connect(url: &str, scan_count: usize) -> Result<Self, StorageError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::debug!(url, "connected to redis");
        Ok(Self::new(conn, scan_count))
    }
}

impl<C: RemoteStore> RedisStorage<C> {
    /// Creates a backend on top of an existing connection.
    ///
    /// `scan_count` is the `COUNT` hint passed to every `SCAN`.
    pub fn new(conn: C, scan_count: usize) -> Self {
        Self {
            conn,
            scan_count: scan_count.max(1),
        }
    }

    /// Deletes all keys matching the glob `pattern`, returning how many were found.
    async fn delete_matching(&self, pattern: &str) -> Result<usize, StorageError> {
        let mut conn = self.conn.clone();
        let mut cursor = 0;
        let mut deleted = 0;

        loop {
            let (next, keys) = conn.scan(cursor, pattern, self.scan_count).await?;
            if !keys.is_empty() {
                deleted += keys.len();
                delete_batch(&mut conn, keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(deleted)
    }
}

async fn delete_batch<C: RemoteStore>(conn: &mut C, keys: Vec<String>) -> Result<(), StorageError> {
    let mut attempt = 0;
    loop {
        match conn.del(keys.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < MAX_BATCH_RETRIES => {
                attempt += 1;
                tracing::debug!(error = %err, attempt, "retrying redis batch delete");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Decodes a stored payload, treating anything but a non-empty JSON array as a miss.
fn decode_entry(key: &str, entry: RemoteEntry) -> Option<CachedValue> {
    let payload = entry.value?;
    let time_left = match entry.pttl {
        -1 => Duration::MAX,
        pttl if pttl > 0 => Duration::from_millis(pttl as u64),
        _ => return None,
    };

    let data: CacheData = match serde_json::from_str(&payload) {
        Ok(data) => data,
        Err(err) => {
            tracing::debug!(key, error = %err, "ignoring malformed redis cache entry");
            return None;
        }
    };
    if data.is_empty() {
        return None;
    }

    Some(CachedValue { data, time_left })
}

/// Escapes all glob metacharacters, so `value` only matches itself in a `MATCH` pattern.
fn escape_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl<C: RemoteStore> Storage for RedisStorage<C> {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(
        &self,
        function_id: &str,
        args_id: &str,
        options: &StorageOptions,
    ) -> Result<Option<CachedValue>, StorageError> {
        let key = storage_key(options.prefix(), function_id, args_id);
        let entry = self.conn.clone().fetch(&key).await?;
        Ok(decode_entry(&key, entry))
    }

    async fn set(
        &self,
        function_id: &str,
        args_id: &str,
        data: CacheData,
        options: &SetOptions,
    ) -> Result<(), StorageError> {
        let key = storage_key(options.prefix(), function_id, args_id);
        let payload = serde_json::to_string(&data)?;
        let ttl_ms = u64::try_from(options.ttl.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        self.conn.clone().set_px(&key, payload, ttl_ms).await?;
        Ok(())
    }

    async fn delete(
        &self,
        function_id: &str,
        options: &StorageOptions,
    ) -> Result<(), StorageError> {
        let pattern = format!(
            "{}*",
            escape_pattern(&function_prefix(options.prefix(), function_id))
        );
        let deleted = self.delete_matching(&pattern).await?;
        tracing::debug!(pattern = %pattern, deleted, "deleted redis cache entries");
        Ok(())
    }

    async fn purge(&self, options: &StorageOptions) -> Result<(), StorageError> {
        let pattern = match options.prefix() {
            Some(prefix) => format!("{}*", escape_pattern(&namespace_prefix(prefix))),
            None => {
                tracing::warn!("purging redis without a prefix, this removes every key");
                "*".to_owned()
            }
        };
        let deleted = self.delete_matching(&pattern).await?;
        tracing::debug!(pattern = %pattern, deleted, "purged redis cache entries");
        Ok(())
    }
}
