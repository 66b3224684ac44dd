//! Tests for tokio spawner utilities and listener binding

use time_broker::core::{BrokerError, Spawn};
use time_broker::runtime::bind;
use time_broker::runtime::tokio_spawner::TokioSpawner;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[tokio::test]
async fn test_bind_reports_address_in_use() {
    let first = bind("127.0.0.1:0").await.unwrap();
    let addr = first.local_addr().unwrap().to_string();

    match bind(&addr).await {
        Err(BrokerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
        other => panic!("expected bind failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bind_rejects_unparseable_address() {
    assert!(matches!(
        bind("not an address").await,
        Err(BrokerError::Bind { .. })
    ));
}
