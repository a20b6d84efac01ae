use std::sync::Arc;
use std::time::Duration;

use memocache::caching::{
    CacheData, RedisStorage, RegisterOptions, SetOptions, Storage, StorageError, StorageOptions,
    resolve_key,
};
use serde_json::json;

use crate::test::{self, CallCounter, FakeRemote};
use crate::{add, settle, setup_controller};

fn options(prefix: &str) -> StorageOptions {
    StorageOptions {
        prefix: Some(prefix.into()),
    }
}

fn set_options(prefix: &str, ttl: Duration) -> SetOptions {
    SetOptions {
        prefix: Some(prefix.into()),
        ttl,
    }
}

/// Fills `remote` with one entry per `(prefix, function_id)` and argument index.
async fn populate(storage: &RedisStorage<FakeRemote>, keys: &[(&str, &str)], per_function: usize) {
    for (prefix, function_id) in keys {
        for idx in 0..per_function {
            let data: CacheData = vec![json!(idx)];
            storage
                .set(
                    function_id,
                    &format!("{idx:02}"),
                    data,
                    &set_options(prefix, Duration::from_secs(60)),
                )
                .await
                .unwrap();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_set_and_expire() {
    test::setup();
    let remote = FakeRemote::new();
    let storage = RedisStorage::new(remote.clone(), 100);

    storage
        .set(
            "add",
            "abc",
            vec![json!(5)],
            &set_options("cache", Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(remote.value("cache:add:abc").as_deref(), Some("[5]"));

    let cached = storage.get("add", "abc", &options("cache")).await.unwrap();
    let cached = cached.unwrap();
    assert_eq!(cached.data, vec![json!(5)]);
    assert_eq!(cached.time_left, Duration::from_secs(5));

    tokio::time::advance(Duration::from_secs(3)).await;
    let cached = storage.get("add", "abc", &options("cache")).await.unwrap();
    assert_eq!(cached.unwrap().time_left, Duration::from_secs(2));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(
        storage.get("add", "abc", &options("cache")).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_raw_payloads() {
    test::setup();
    let remote = FakeRemote::new();
    let storage = RedisStorage::new(remote.clone(), 100);

    remote.insert("cache:f:persistent", r#"[{"a":1},"b"]"#, None);
    remote.insert("cache:f:empty", "[]", None);
    remote.insert("cache:f:object", r#"{"a":1}"#, None);
    remote.insert("cache:f:garbage", "{{{", None);

    let cached = storage
        .get("f", "persistent", &options("cache"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.data, vec![json!({"a": 1}), json!("b")]);
    assert_eq!(cached.time_left, Duration::MAX);

    for args_id in ["empty", "object", "garbage", "missing"] {
        let cached = storage.get("f", args_id, &options("cache")).await.unwrap();
        assert_eq!(cached, None, "{args_id} should be a miss");
    }
}

#[tokio::test]
async fn test_delete_pages_through_keyspace() {
    test::setup();
    let remote = FakeRemote::new();
    let storage = RedisStorage::new(remote.clone(), 3);

    populate(
        &storage,
        &[("cache", "fn1"), ("cache", "fn10"), ("other", "fn1")],
        10,
    )
    .await;
    assert_eq!(remote.keys().len(), 30);

    storage.delete("fn1", &options("cache")).await.unwrap();

    let keys = remote.keys();
    assert_eq!(keys.len(), 20);
    assert!(keys.iter().all(|key| !key.starts_with("cache:fn1:")));
    assert_eq!(
        keys.iter().filter(|key| key.starts_with("cache:fn10:")).count(),
        10
    );

    // the whole keyspace was walked in pages of three keys
    assert_eq!(remote.scans(), 10);
}

#[tokio::test]
async fn test_delete_retries_batches() {
    test::setup();
    let remote = FakeRemote::new();
    let storage = RedisStorage::new(remote.clone(), 100);

    populate(&storage, &[("cache", "fn1")], 5).await;
    remote.fail_next_deletes(2);
    storage.delete("fn1", &options("cache")).await.unwrap();
    assert!(remote.keys().is_empty());

    populate(&storage, &[("cache", "fn1")], 5).await;
    remote.fail_next_deletes(3);
    let err = storage.delete("fn1", &options("cache")).await.unwrap_err();
    assert!(matches!(err, StorageError::Redis(_)));
    assert_eq!(remote.keys().len(), 5);
}

#[tokio::test]
async fn test_purge() {
    test::setup();
    let remote = FakeRemote::new();
    let storage = RedisStorage::new(remote.clone(), 4);

    populate(
        &storage,
        &[("cache", "fn1"), ("cache", "fn2"), ("other", "fn1")],
        3,
    )
    .await;
    remote.insert("unrelated", "[1]", None);

    storage.purge(&options("cache")).await.unwrap();
    let keys = remote.keys();
    assert_eq!(keys.len(), 4);
    assert!(keys.iter().all(|key| !key.starts_with("cache:")));

    storage.purge(&StorageOptions::default()).await.unwrap();
    assert!(remote.keys().is_empty());
}

#[tokio::test]
async fn test_prefix_is_not_a_pattern() {
    test::setup();
    let remote = FakeRemote::new();
    let storage = RedisStorage::new(remote.clone(), 100);

    populate(&storage, &[("a*", "fn"), ("ab", "fn"), ("a?", "fn")], 2).await;

    storage.purge(&options("a*")).await.unwrap();
    let keys = remote.keys();
    assert_eq!(keys.len(), 4);
    assert!(keys.iter().all(|key| !key.starts_with("a*:")));
}

#[tokio::test(start_paused = true)]
async fn test_cached_function_on_redis() {
    let remote = FakeRemote::new();
    let storage = Arc::new(RedisStorage::new(remote.clone(), 100));
    let controller = setup_controller(storage, |_| {});

    let counter = CallCounter::new();
    let add = controller
        .register(add(&counter), RegisterOptions::new("add"))
        .unwrap();

    assert_eq!(add.cache((2, 3)).await, Ok(5));
    settle().await;

    let key = format!("cache:add:{}", resolve_key(&json!([2, 3])));
    assert_eq!(remote.keys(), vec![key.clone()]);
    assert_eq!(remote.value(&key).as_deref(), Some("[5]"));

    assert_eq!(add.cache((2, 3)).await, Ok(5));
    assert_eq!(counter.count(), 1);

    add.clear().await.unwrap();
    assert!(remote.keys().is_empty());
}
