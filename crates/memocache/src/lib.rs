//! Memoization of asynchronous operations behind a time-bounded, pluggable cache.
//!
//! See the [`caching`] module for an explanation of how a cached call is resolved.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod utils;

pub use caching::{
    CacheController, CacheError, CacheKey, CachedFunction, ErrorSink, RegisterOptions, Storage,
    StorageRef,
};
pub use config::Config;
