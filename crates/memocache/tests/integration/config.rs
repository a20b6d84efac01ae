use std::time::Duration;

use memocache::Config;
use memocache::caching::{CacheController, CacheError, RegisterOptions};

use crate::test::{self, CallCounter};
use crate::{add, settle};

#[tokio::test(start_paused = true)]
async fn test_controller_from_config() {
    test::setup();

    let yaml = r#"
        storage:
          type: memory
        cache:
          prefix: memo
          ttl: 10s
          precache: 4s
    "#;
    let config = Config::from_reader(yaml.as_bytes()).unwrap();
    let controller = CacheController::from_config(&config).await.unwrap();

    let counter = CallCounter::new();
    let add = controller
        .register(add(&counter), RegisterOptions::new("add"))
        .unwrap();
    let registration = add.registration();
    assert_eq!(registration.prefix(), Some("memo"));
    assert_eq!(registration.ttl(), Duration::from_secs(10));
    assert_eq!(registration.precache(), Some(Duration::from_secs(4)));

    assert_eq!(add.cache((20, 22)).await, Ok(42));
    settle().await;
    assert_eq!(add.cache((20, 22)).await, Ok(42));
    assert_eq!(counter.count(), 1);

    controller.clear("add").await.unwrap();
    assert_eq!(add.cache((20, 22)).await, Ok(42));
    assert_eq!(counter.count(), 2);
}

#[tokio::test]
async fn test_controller_requires_storage() {
    test::setup();

    let yaml = r#"
        cache:
          ttl: 10s
    "#;
    let config = Config::from_reader(yaml.as_bytes()).unwrap();
    let err = CacheController::from_config(&config).await.unwrap_err();
    assert_eq!(
        err,
        CacheError::Configuration("a storage backend is required".into())
    );
}

#[tokio::test]
async fn test_unreachable_redis() {
    test::setup();

    let yaml = r#"
        storage:
          type: redis
          url: "not a redis url"
    "#;
    let config = Config::from_reader(yaml.as_bytes()).unwrap();
    let err = CacheController::from_config(&config).await.unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(err.to_string().contains("failed to create storage"));
}
