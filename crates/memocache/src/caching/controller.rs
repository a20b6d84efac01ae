use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use super::cache_key::{HashFn, resolve_args, resolve_key};
use super::storage::{self, CacheData, CachedValue, SetOptions, StorageOptions, StorageRef};
use super::{CacheError, CacheKey, ErrorSink};
use crate::config::{CacheConfig, Config};
use crate::utils::futures::CallOnDrop;

/// The set of keys that currently have a background refresh running.
type Refreshes = Arc<Mutex<HashSet<CacheKey>>>;

type Operation<A, T> = Box<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Creates cached versions of async operations on top of a shared storage.
///
/// All registrations made through one controller share its storage, its [`ErrorSink`] and the
/// bookkeeping of in-flight background refreshes. Cloning the controller is cheap.
#[derive(Debug, Clone)]
pub struct CacheController {
    storage: StorageRef,
    defaults: CacheConfig,
    errors: ErrorSink,
    refreshes: Refreshes,
}

impl CacheController {
    /// Creates a controller on top of `storage`, with `defaults` for all registrations.
    ///
    /// Fails with [`CacheError::Configuration`] if there is no storage or the defaults are
    /// invalid.
    pub fn new(storage: Option<StorageRef>, mut defaults: CacheConfig) -> Result<Self, CacheError> {
        let storage = storage.ok_or_else(|| {
            CacheError::Configuration("a storage backend is required".into())
        })?;
        if defaults.ttl.is_zero() {
            return Err(CacheError::Configuration(
                "the default ttl must be greater than zero".into(),
            ));
        }

        // an empty prefix stores keys as `function_id:args_id`, the same as no prefix
        defaults.prefix = defaults.prefix.filter(|prefix| !prefix.is_empty());

        Ok(Self {
            storage,
            defaults,
            errors: ErrorSink::new(),
            refreshes: Default::default(),
        })
    }

    /// Creates the configured storage backend and a controller on top of it.
    pub async fn from_config(config: &Config) -> Result<Self, CacheError> {
        let storage = match &config.storage {
            Some(storage) => Some(
                storage::from_config(storage)
                    .await
                    .map_err(|err| CacheError::configuration("failed to create storage", &err))?,
            ),
            None => None,
        };
        Self::new(storage, config.cache.clone())
    }

    /// Routes detached errors to `errors` instead of a sink owned by this controller.
    ///
    /// Only affects registrations made after this call.
    pub fn with_error_sink(mut self, errors: ErrorSink) -> Self {
        self.errors = errors;
        self
    }

    /// The sink receiving all errors of detached writes and background refreshes.
    pub fn errors(&self) -> &ErrorSink {
        &self.errors
    }

    pub fn storage(&self) -> &StorageRef {
        &self.storage
    }

    pub fn defaults(&self) -> &CacheConfig {
        &self.defaults
    }

    /// Wraps `operation` into a [`CachedFunction`].
    ///
    /// The options are resolved against the controller defaults once, here. Fails with
    /// [`CacheError::Configuration`] if they are invalid.
    pub fn register<A, T, F, Fut>(
        &self,
        operation: F,
        options: RegisterOptions,
    ) -> Result<CachedFunction<A, T>, CacheError>
    where
        A: Serialize + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let registration = options.resolve(&self.defaults)?;
        tracing::debug!(
            function = registration.function_id(),
            prefix = registration.prefix(),
            ttl = ?registration.ttl(),
            precache = ?registration.precache(),
            timeout = ?registration.timeout(),
            "registered cached function"
        );

        let operation: Operation<A, T> = Box::new(move |args| operation(args).boxed());

        Ok(CachedFunction {
            inner: Arc::new(FunctionInner {
                registration,
                storage: Arc::clone(&self.storage),
                errors: self.errors.clone(),
                refreshes: Arc::clone(&self.refreshes),
                operation,
            }),
        })
    }

    fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            prefix: self.defaults.prefix.as_deref().map(Arc::from),
        }
    }

    /// Deletes all entries of `function_id` under the default prefix.
    pub async fn clear(&self, function_id: &str) -> Result<(), CacheError> {
        let options = self.storage_options();
        self.storage
            .delete(function_id, &options)
            .await
            .map_err(|err| CacheError::storage_write(&err))
    }

    /// Deletes all entries under the default prefix.
    ///
    /// Without a default prefix, this wipes the whole storage.
    pub async fn purge(&self) -> Result<(), CacheError> {
        let options = self.storage_options();
        self.storage
            .purge(&options)
            .await
            .map_err(|err| CacheError::storage_write(&err))
    }
}

/// Per-registration overrides of the [`CacheConfig`] defaults.
///
/// Every registration needs a `key`. It identifies the function in the storage, so entries
/// survive restarts and two registrations with the same key share their entries.
#[derive(Clone)]
pub struct RegisterOptions {
    key: String,
    prefix: Option<Option<String>>,
    ttl: Option<Duration>,
    precache: Option<Option<Duration>>,
    timeout: Option<Option<Duration>>,
    hash: Option<HashFn>,
}

impl RegisterOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefix: None,
            ttl: None,
            precache: None,
            timeout: None,
            hash: None,
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(Some(prefix.into()));
        self
    }

    /// Stores entries as `function_id:args_id`, even if the defaults have a prefix.
    pub fn without_prefix(mut self) -> Self {
        self.prefix = Some(None);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Refreshes entries in the background once they are at least `precache` old.
    pub fn precache(mut self, precache: Duration) -> Self {
        self.precache = Some(Some(precache));
        self
    }

    pub fn without_precache(mut self) -> Self {
        self.precache = Some(None);
        self
    }

    /// Treats storage lookups that take longer than `timeout` as a miss.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(Some(timeout));
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = Some(None);
        self
    }

    /// Replaces the function turning call arguments into an `args_id`.
    ///
    /// Defaults to [`resolve_key`].
    pub fn hash<H>(mut self, hash: H) -> Self
    where
        H: Fn(&Value) -> String + Send + Sync + 'static,
    {
        let hash: HashFn = Arc::new(hash);
        self.hash = Some(hash);
        self
    }

    fn resolve(self, defaults: &CacheConfig) -> Result<Registration, CacheError> {
        let key = self.key.trim();
        if key.is_empty() {
            return Err(CacheError::Configuration(
                "a non-empty key is required to register a function".into(),
            ));
        }

        let ttl = self.ttl.unwrap_or(defaults.ttl);
        if ttl.is_zero() {
            return Err(CacheError::Configuration(format!(
                "the ttl of `{key}` must be greater than zero"
            )));
        }

        let prefix = self
            .prefix
            .unwrap_or_else(|| defaults.prefix.clone())
            .filter(|prefix| !prefix.is_empty());

        Ok(Registration {
            function_id: key.into(),
            prefix: prefix.map(Arc::from),
            ttl,
            precache: self.precache.unwrap_or(defaults.precache),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            hash: self.hash.unwrap_or_else(|| Arc::new(resolve_key) as HashFn),
        })
    }
}

impl fmt::Debug for RegisterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterOptions")
            .field("key", &self.key)
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .field("precache", &self.precache)
            .field("timeout", &self.timeout)
            .field("hash", &self.hash.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// The settings of one registered function, fixed at registration.
#[derive(Clone)]
pub struct Registration {
    function_id: Arc<str>,
    prefix: Option<Arc<str>>,
    ttl: Duration,
    precache: Option<Duration>,
    timeout: Option<Duration>,
    hash: HashFn,
}

impl Registration {
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn precache(&self) -> Option<Duration> {
        self.precache
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether a hit with `time_left` remaining is old enough to be refreshed.
    fn needs_refresh(&self, time_left: Duration) -> bool {
        match self.precache {
            Some(precache) => self.ttl.saturating_sub(time_left) >= precache,
            None => false,
        }
    }

    fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            prefix: self.prefix.clone(),
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("function_id", &self.function_id)
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .field("precache", &self.precache)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A memoized async operation, created by [`CacheController::register`].
///
/// Cloning is cheap, all clones share the same registration.
pub struct CachedFunction<A, T> {
    inner: Arc<FunctionInner<A, T>>,
}

struct FunctionInner<A, T> {
    registration: Registration,
    storage: StorageRef,
    errors: ErrorSink,
    refreshes: Refreshes,
    operation: Operation<A, T>,
}

impl<A, T> Clone for CachedFunction<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T> fmt::Debug for CachedFunction<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFunction")
            .field("registration", &self.inner.registration)
            .finish_non_exhaustive()
    }
}

impl<A, T> CachedFunction<A, T>
where
    A: Serialize + Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn function_id(&self) -> &str {
        self.inner.registration.function_id()
    }

    pub fn registration(&self) -> &Registration {
        &self.inner.registration
    }

    /// Returns the result of the operation for `args`, from the cache if possible.
    ///
    /// On a miss, the operation is run and its result is returned right away, while it is
    /// written to the storage in the background. A hit that is older than the `precache` window
    /// is returned as well, and additionally refreshed in the background, at most once at a time
    /// per key.
    ///
    /// # Errors
    ///
    /// Failures of the key resolution, of the storage lookup, and of the operation itself on a
    /// miss are returned. Failures that happen after the result was returned go to the
    /// [`ErrorSink`] instead.
    pub async fn cache(&self, args: A) -> Result<T, CacheError> {
        let registration = &self.inner.registration;
        let function = registration.function_id();
        metric!(counter("caches.access") += 1, "function" => function);

        let args_id = resolve_args(&args, &*registration.hash)?;
        let key = CacheKey::new(
            registration.prefix.clone(),
            Arc::clone(&registration.function_id),
            args_id,
        );

        let Some(cached) = self.lookup(&key).await? else {
            tracing::trace!(%key, "cache miss");
            metric!(counter("caches.miss") += 1, "function" => function);
            return self.compute(args, key).await;
        };

        let value = match decode::<T>(cached.data) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(%key, error = %err, "ignoring undecodable cache entry");
                metric!(counter("caches.miss") += 1, "function" => function);
                return self.compute(args, key).await;
            }
        };

        metric!(counter("caches.hit") += 1, "function" => function);
        if registration.needs_refresh(cached.time_left) {
            tracing::trace!(%key, time_left = ?cached.time_left, "stale cache hit");
            self.spawn_refresh(args, key);
        } else {
            tracing::trace!(%key, "cache hit");
        }

        Ok(value)
    }

    /// Deletes all entries of this function, for any arguments.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let registration = &self.inner.registration;
        self.inner
            .storage
            .delete(registration.function_id(), &registration.storage_options())
            .await
            .map_err(|err| CacheError::storage_write(&err))
    }

    /// Looks `key` up in the storage, giving up after the configured timeout.
    ///
    /// A lookup that times out keeps running in the background, only its result is ignored.
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedValue>, CacheError> {
        let registration = &self.inner.registration;
        let options = registration.storage_options();

        let Some(timeout) = registration.timeout else {
            return self
                .inner
                .storage
                .get(key.function_id(), key.args_id(), &options)
                .await
                .map_err(|err| CacheError::storage_read(&err));
        };

        let storage = Arc::clone(&self.inner.storage);
        let lookup = tokio::spawn({
            let key = key.clone();
            async move {
                storage
                    .get(key.function_id(), key.args_id(), &options)
                    .await
            }
        });

        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(result)) => result.map_err(|err| CacheError::storage_read(&err)),
            Ok(Err(join_error)) => Err(CacheError::storage_read(&join_error)),
            Err(_elapsed) => {
                tracing::trace!(%key, ?timeout, "cache lookup timed out");
                metric!(counter("caches.timeout") += 1, "function" => registration.function_id());
                Ok(None)
            }
        }
    }

    /// Runs the operation for a miss and stores its result in the background.
    async fn compute(&self, args: A, key: CacheKey) -> Result<T, CacheError> {
        let function = self.inner.registration.function_id();
        metric!(counter("caches.computation") += 1, "function" => function);

        let start = Instant::now();
        let result = (self.inner.operation)(args).await;
        metric!(timer("caches.computation.duration") = start.elapsed(), "function" => function);

        let value = result.map_err(|err| CacheError::operation(&err))?;

        match encode(&value) {
            Ok(data) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.store(key, data).await });
            }
            Err(err) => self.inner.errors.emit(CacheError::storage_write(&err)),
        }

        Ok(value)
    }

    /// Recomputes `key` in the background, unless a refresh for it is already running.
    fn spawn_refresh(&self, args: A, key: CacheKey) {
        let function = self.inner.registration.function_id();

        let mut refreshes = lock(&self.inner.refreshes);
        if !refreshes.insert(key.clone()) {
            metric!(counter("caches.refresh") += 1, "function" => function, "status" => "deduplicated");
            return;
        }
        metric!(gauge("caches.refreshes_in_flight") = refreshes.len() as u64, "function" => function);
        drop(refreshes);

        let done_token = {
            let key = key.clone();
            let refreshes = Arc::clone(&self.inner.refreshes);
            CallOnDrop::new(move || {
                lock(&refreshes).remove(&key);
            })
        };

        metric!(counter("caches.refresh") += 1, "function" => function, "status" => "spawned");
        tracing::trace!(%key, "spawning background refresh");

        let refresh = (self.inner.operation)(args);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _done_token = done_token; // move into the future

            match refresh.await {
                Ok(value) => match encode(&value) {
                    Ok(data) => inner.store(key, data).await,
                    Err(err) => inner.errors.emit(CacheError::storage_write(&err)),
                },
                Err(err) => inner.errors.emit(CacheError::background_refresh(&err)),
            }
        });
    }
}

impl<A, T> FunctionInner<A, T> {
    /// Writes a computed result, reporting failures to the error sink.
    async fn store(&self, key: CacheKey, data: CacheData) {
        let function = self.registration.function_id();
        let options = SetOptions {
            prefix: self.registration.prefix.clone(),
            ttl: self.registration.ttl,
        };

        match self
            .storage
            .set(key.function_id(), key.args_id(), data, &options)
            .await
        {
            Ok(()) => {
                metric!(counter("caches.store") += 1, "function" => function, "status" => "ok");
            }
            Err(err) => {
                metric!(counter("caches.store") += 1, "function" => function, "status" => "error");
                self.errors.emit(CacheError::storage_write(&err));
            }
        }
    }
}

fn lock(refreshes: &Refreshes) -> MutexGuard<'_, HashSet<CacheKey>> {
    refreshes.lock().unwrap_or_else(PoisonError::into_inner)
}

fn encode<T: Serialize>(value: &T) -> Result<CacheData, serde_json::Error> {
    Ok(vec![serde_json::to_value(value)?])
}

/// Decodes stored values, a single value as itself and several values as a sequence.
fn decode<T: DeserializeOwned>(mut data: CacheData) -> Result<T, serde_json::Error> {
    let value = if data.len() == 1 {
        data.pop().unwrap_or_default()
    } else {
        Value::Array(data)
    };
    serde_json::from_value(value)
}
