use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use memocache::caching::{CacheController, MemoryStorage, StorageRef};
use memocache::config::CacheConfig;

pub use memocache_test as test;

/// Setup tests and create a controller on top of `storage`.
///
/// The `update_config` closure can modify the default registration options before the controller
/// is created.
pub fn setup_controller(
    storage: StorageRef,
    update_config: impl FnOnce(&mut CacheConfig),
) -> CacheController {
    test::setup();

    let mut config = CacheConfig::default();
    update_config(&mut config);

    CacheController::new(Some(storage), config).unwrap()
}

/// A fresh in-memory storage.
pub fn memory_storage() -> StorageRef {
    Arc::new(MemoryStorage::new())
}

/// Adds two numbers, recording every invocation in `counter`.
pub fn add(
    counter: &test::CallCounter,
) -> impl Fn((i64, i64)) -> BoxFuture<'static, anyhow::Result<i64>> + Send + Sync + 'static {
    let counter = counter.clone();
    move |(a, b)| {
        counter.hit();
        Box::pin(async move { anyhow::Ok(a + b) })
    }
}

/// Returns the number of its invocation, after taking `delay`.
pub fn versioned(
    counter: &test::CallCounter,
    delay: Duration,
) -> impl Fn(&'static str) -> BoxFuture<'static, anyhow::Result<usize>> + Send + Sync + 'static {
    let counter = counter.clone();
    move |_| {
        let version = counter.hit();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            anyhow::Ok(version)
        })
    }
}

/// Gives detached writes the chance to finish.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
