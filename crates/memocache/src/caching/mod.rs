//! # Memocache caching infrastructure
//!
//! This module memoizes the results of async operations in a pluggable [`Storage`]. An operation
//! is registered once with a [`CacheController`], which turns it into a [`CachedFunction`].
//! Calling [`CachedFunction::cache`] then resolves to the result of the operation, either from the
//! storage or freshly computed.
//!
//! ## Resolving a call
//!
//! A call goes through the following steps:
//!
//! - The call arguments are serialized and hashed into an `args_id`, independently of the order
//!   of fields in any object (see [`resolve_key`]). Together with the optional prefix and the
//!   `function_id` of the registration, this forms the [`CacheKey`].
//! - The key is looked up in the storage. If a `timeout` is configured, a lookup taking longer
//!   than that is treated as a miss. The lookup itself keeps running, but its result is dropped.
//! - On a miss, the operation is run and its result returned right away. Writing it to the
//!   storage happens in a detached task.
//! - On a hit, the stored result is returned. If a `precache` window is configured and the entry
//!   is at least that old, it is additionally refreshed in a background task. There is at most
//!   one refresh per key running at any time, further stale hits just return the stored value.
//!
//! Errors that happen before a result was handed to the caller are returned to it. All errors of
//! detached writes and background refreshes go to the [`ErrorSink`] of the controller. Results of
//! failed operations are never stored.
//!
//! ## Storage
//!
//! The storage only needs to support four operations: looking up a single entry, storing one
//! with a TTL, and deleting all entries of either a function or a whole prefix. Expiry is left to
//! the storage, there is no capacity limit or eviction on our side. Two backends are provided:
//!
//! - [`MemoryStorage`], which keeps entries in-process.
//! - [`RedisStorage`], which keeps entries in a redis server as JSON arrays.
//!
//! ## Metrics
//!
//! All metrics are tagged with the `function` they belong to:
//!
//! - `caches.access`: All calls.
//! - `caches.hit` / `caches.miss`: Calls served from the storage, and those that were not.
//! - `caches.timeout`: Lookups that took longer than the configured timeout.
//! - `caches.computation`: Operations run for a miss, with their `caches.computation.duration`.
//! - `caches.refresh`: Background refreshes, tagged with a `status` of `spawned` or
//!   `deduplicated`.
//! - `caches.refreshes_in_flight`: The number of background refreshes running.
//! - `caches.store`: Detached writes, tagged with a `status` of `ok` or `error`.
//! - `caches.errors`: Errors routed to the error sink, tagged with their `kind` instead.

mod cache_error;
mod cache_key;
mod controller;
mod error_sink;
pub mod storage;

pub use cache_error::CacheError;
pub use cache_key::{
    CacheKey, HashFn, canonicalize, function_prefix, namespace_prefix, resolve_args, resolve_key,
    storage_key,
};
pub use controller::{CacheController, CachedFunction, RegisterOptions, Registration};
pub use error_sink::{ErrorSink, SubscriptionId};
pub use storage::{
    CacheData, CachedValue, MemoryStorage, RedisStorage, RemoteEntry, RemoteStore, SetOptions,
    Storage, StorageError, StorageOptions, StorageRef,
};
