//! Helpers for testing cached functions and storage backends.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Detached writes only happen once the test yields to the runtime. With a paused clock, a
//!    short `tokio::time::sleep` is enough to let them finish.
//!
//!  - [`FakeRemote`] follows the paused tokio clock for expiry, so `tokio::time::advance` can be
//!    used to let redis entries expire.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use memocache::caching::{
    CacheData, CachedValue, RemoteEntry, RemoteStore, SetOptions, Storage, StorageError,
    StorageOptions, StorageRef,
};
use redis::{ErrorKind, RedisError, RedisResult};
use tokio::time::Instant;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memocache` crate and mutes all
///    other logs (such as redis or moka).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memocache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts invocations of a wrapped operation.
#[derive(Clone, Debug, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call and returns how many calls there were so far, including this one.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A storage whose lookups take `delay` before they reach the wrapped storage.
pub struct DelayedStorage {
    inner: StorageRef,
    delay: Duration,
    lookups: AtomicUsize,
}

impl DelayedStorage {
    pub fn new(inner: StorageRef, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            lookups: AtomicUsize::new(0),
        }
    }

    /// The number of lookups that made it through the delay.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for DelayedStorage {
    fn name(&self) -> &'static str {
        "delayed"
    }

    async fn get(
        &self,
        function_id: &str,
        args_id: &str,
        options: &StorageOptions,
    ) -> Result<Option<CachedValue>, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get(function_id, args_id, options).await
    }

    async fn set(
        &self,
        function_id: &str,
        args_id: &str,
        data: CacheData,
        options: &SetOptions,
    ) -> Result<(), StorageError> {
        self.inner.set(function_id, args_id, data, options).await
    }

    async fn delete(
        &self,
        function_id: &str,
        options: &StorageOptions,
    ) -> Result<(), StorageError> {
        self.inner.delete(function_id, options).await
    }

    async fn purge(&self, options: &StorageOptions) -> Result<(), StorageError> {
        self.inner.purge(options).await
    }
}

/// A storage that can be told to fail its reads or writes.
///
/// Writes are `set`, `delete` and `purge`. Both kinds of operations pass through to the wrapped
/// storage until told otherwise.
pub struct FailingStorage {
    inner: StorageRef,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FailingStorage {
    pub fn new(inner: StorageRef) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool, operation: &str) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("{operation} refused").into());
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FailingStorage {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn get(
        &self,
        function_id: &str,
        args_id: &str,
        options: &StorageOptions,
    ) -> Result<Option<CachedValue>, StorageError> {
        self.check(&self.fail_reads, "get")?;
        self.inner.get(function_id, args_id, options).await
    }

    async fn set(
        &self,
        function_id: &str,
        args_id: &str,
        data: CacheData,
        options: &SetOptions,
    ) -> Result<(), StorageError> {
        self.check(&self.fail_writes, "set")?;
        self.inner.set(function_id, args_id, data, options).await
    }

    async fn delete(
        &self,
        function_id: &str,
        options: &StorageOptions,
    ) -> Result<(), StorageError> {
        self.check(&self.fail_writes, "delete")?;
        self.inner.delete(function_id, options).await
    }

    async fn purge(&self, options: &StorageOptions) -> Result<(), StorageError> {
        self.check(&self.fail_writes, "purge")?;
        self.inner.purge(options).await
    }
}

#[derive(Debug, Clone)]
struct FakeEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl FakeEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Debug, Default)]
struct FakeState {
    entries: BTreeMap<String, FakeEntry>,
    /// The last key returned for each open `SCAN` cursor.
    cursors: HashMap<u64, String>,
    next_cursor: u64,
    failing_deletes: usize,
    scans: usize,
}

impl FakeState {
    fn live_entry(&mut self, key: &str) -> Option<&FakeEntry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }
}

/// An in-process stand-in for a redis server.
///
/// `SCAN` walks the keys in sorted order and hands out at most `count` of them per call, like a
/// server would for a large keyspace. Cursors stay valid when keys are deleted in between.
#[derive(Debug, Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a raw payload, bypassing any encoding.
    pub fn insert(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let entry = FakeEntry {
            value: value.to_owned(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.state.lock().unwrap().entries.insert(key.to_owned(), entry);
    }

    /// Returns the raw payload stored under `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state.live_entry(key).map(|entry| entry.value.clone())
    }

    /// All keys that have not expired yet, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Makes the next `count` `DEL` commands fail.
    pub fn fail_next_deletes(&self, count: usize) {
        self.state.lock().unwrap().failing_deletes = count;
    }

    /// The number of `SCAN` commands run so far.
    pub fn scans(&self) -> usize {
        self.state.lock().unwrap().scans
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn fetch(&mut self, key: &str) -> RedisResult<RemoteEntry> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let entry = match state.live_entry(key) {
            Some(entry) => RemoteEntry {
                value: Some(entry.value.clone()),
                pttl: match entry.expires_at {
                    Some(expires_at) => (expires_at - now).as_millis() as i64,
                    None => -1,
                },
            },
            None => RemoteEntry {
                value: None,
                pttl: -2,
            },
        };
        Ok(entry)
    }

    async fn set_px(&mut self, key: &str, value: String, ttl_ms: u64) -> RedisResult<()> {
        let entry = FakeEntry {
            value,
            expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
        };
        self.state.lock().unwrap().entries.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> RedisResult<(u64, Vec<String>)> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.scans += 1;

        let start = match cursor {
            0 => Bound::Unbounded,
            cursor => match state.cursors.remove(&cursor) {
                Some(last) => Bound::Excluded(last),
                None => return Err(RedisError::from((ErrorKind::ResponseError, "invalid cursor"))),
            },
        };

        let page: Vec<(String, bool)> = state
            .entries
            .range::<String, _>((start, Bound::Unbounded))
            .take(count)
            .map(|(key, entry)| (key.clone(), entry.is_live(now)))
            .collect();

        let keys = page
            .iter()
            .filter(|(key, live)| *live && glob_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();

        let exhausted = page.len() < count
            || page.last().is_none_or(|(last, _)| {
                state
                    .entries
                    .range::<String, _>((Bound::Excluded(last.clone()), Bound::Unbounded))
                    .next()
                    .is_none()
            });
        if exhausted {
            return Ok((0, keys));
        }

        state.next_cursor += 1;
        let next = state.next_cursor;
        if let Some((last, _)) = page.last() {
            state.cursors.insert(next, last.clone());
        }
        Ok((next, keys))
    }

    async fn del(&mut self, keys: Vec<String>) -> RedisResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(RedisError::from((ErrorKind::IoError, "connection reset")));
        }
        for key in keys {
            state.entries.remove(&key);
        }
        Ok(())
    }
}

/// Matches `text` against a redis glob pattern supporting `*`, `?` and `\` escapes.
fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches_from(&pattern, &text)
}

fn matches_from(pattern: &[char], text: &[char]) -> bool {
    match pattern {
        [] => text.is_empty(),
        ['*', rest @ ..] => (0..=text.len()).any(|skip| matches_from(rest, &text[skip..])),
        ['?', rest @ ..] => !text.is_empty() && matches_from(rest, &text[1..]),
        ['\\', escaped, rest @ ..] => text.first() == Some(escaped) && matches_from(rest, &text[1..]),
        [c, rest @ ..] => text.first() == Some(c) && matches_from(rest, &text[1..]),
    }
}
