use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use memocache::caching::{CacheError, RegisterOptions, StorageRef};

use crate::test::{CallCounter, DelayedStorage, FailingStorage};
use crate::{add, memory_storage, settle, setup_controller, versioned};

#[tokio::test(start_paused = true)]
async fn test_add_is_computed_once() {
    let controller = setup_controller(memory_storage(), |_| {});
    let counter = CallCounter::new();
    let add = controller
        .register(
            add(&counter),
            RegisterOptions::new("add").ttl(Duration::from_secs(1)),
        )
        .unwrap();

    assert_eq!(add.cache((2, 3)).await, Ok(5));
    assert_eq!(counter.count(), 1);
    settle().await;

    assert_eq!(add.cache((2, 3)).await, Ok(5));
    assert_eq!(counter.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_ahead() {
    let controller = setup_controller(memory_storage(), |config| {
        config.ttl = Duration::from_secs(5);
        config.precache = Some(Duration::from_secs(2));
    });
    let counter = CallCounter::new();
    let cached = controller
        .register(
            versioned(&counter, Duration::from_millis(500)),
            RegisterOptions::new("versioned"),
        )
        .unwrap();

    assert_eq!(cached.cache("a").await, Ok(1));
    settle().await;

    tokio::time::sleep(Duration::from_secs(4)).await;

    // the stale value comes back right away, the refresh runs in the background
    let start = tokio::time::Instant::now();
    assert_eq!(cached.cache("a").await, Ok(1));
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(counter.count(), 2);

    // a second call within the same refresh window does not refresh again
    assert_eq!(cached.cache("a").await, Ok(1));
    assert_eq!(counter.count(), 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(cached.cache("a").await, Ok(2));
    assert_eq!(counter.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shared_refreshes_across_clones() {
    let controller = setup_controller(memory_storage(), |config| {
        config.ttl = Duration::from_secs(5);
        config.precache = Some(Duration::from_secs(2));
    });
    let counter = CallCounter::new();
    let cached = controller
        .register(
            versioned(&counter, Duration::from_secs(1)),
            RegisterOptions::new("versioned"),
        )
        .unwrap();

    assert_eq!(cached.cache("a").await, Ok(1));
    settle().await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    // concurrent callers on different tasks see the same in-flight refresh
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cached = cached.clone();
            tokio::spawn(async move { cached.cache("a").await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(1));
    }
    assert_eq!(counter.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_storage_times_out() {
    let storage = Arc::new(DelayedStorage::new(
        memory_storage(),
        Duration::from_secs(2),
    ));
    let controller = setup_controller(storage.clone(), |config| {
        config.timeout = Some(Duration::from_millis(200));
    });
    let counter = CallCounter::new();
    let add = controller
        .register(add(&counter), RegisterOptions::new("add"))
        .unwrap();

    let start = tokio::time::Instant::now();
    assert_eq!(add.cache((2, 3)).await, Ok(5));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(counter.count(), 1);
    assert_eq!(storage.lookups(), 0);

    // the abandoned lookup still completes
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(storage.lookups(), 1);

    // registrations without a timeout wait for the storage
    let patient = controller
        .register(
            crate::add(&counter),
            RegisterOptions::new("add").without_timeout(),
        )
        .unwrap();
    assert_eq!(patient.cache((2, 3)).await, Ok(5));
    assert_eq!(counter.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failures_of_detached_writes() {
    let storage = Arc::new(FailingStorage::new(memory_storage()));
    let controller = setup_controller(storage.clone(), |_| {});

    let failures = Arc::new(AtomicUsize::new(0));
    let subscription = controller.errors().on({
        let failures = Arc::clone(&failures);
        move |err| {
            assert!(matches!(err, CacheError::StorageWrite(_)));
            failures.fetch_add(1, Ordering::SeqCst);
        }
    });

    let counter = CallCounter::new();
    let add = controller
        .register(add(&counter), RegisterOptions::new("add"))
        .unwrap();

    storage.fail_writes(true);
    assert_eq!(add.cache((2, 3)).await, Ok(5));
    settle().await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    // clearing is not detached, so its failure goes to the caller
    assert_eq!(
        add.clear().await,
        Err(CacheError::StorageWrite("delete refused".into()))
    );
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    assert!(controller.errors().off(subscription));
    assert_eq!(add.cache((2, 3)).await, Ok(5));
    settle().await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(counter.count(), 2);

    storage.fail_writes(false);
    storage.fail_reads(true);
    assert_eq!(
        add.cache((2, 3)).await,
        Err(CacheError::StorageRead("get refused".into()))
    );
    assert_eq!(counter.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_controllers_share_storage() {
    let storage: StorageRef = memory_storage();
    let first = setup_controller(storage.clone(), |_| {});
    let second = setup_controller(storage, |_| {});

    let counter = CallCounter::new();
    let from_first = first
        .register(add(&counter), RegisterOptions::new("add"))
        .unwrap();
    let from_second = second
        .register(add(&counter), RegisterOptions::new("add"))
        .unwrap();

    assert_eq!(from_first.cache((1, 1)).await, Ok(2));
    settle().await;
    assert_eq!(from_second.cache((1, 1)).await, Ok(2));
    assert_eq!(counter.count(), 1);

    second.purge().await.unwrap();
    assert_eq!(from_first.cache((1, 1)).await, Ok(2));
    assert_eq!(counter.count(), 2);
}
