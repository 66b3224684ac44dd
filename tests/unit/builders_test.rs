//! Tests for builder modules

use std::sync::Arc;

use time_broker::builders::{build_dispatcher, build_registry, build_tcp_dispatcher};
use time_broker::config::{BrokerConfig, ModelConfig};
use time_broker::core::{
    BrokerError, ModelTransport, ReceiverTransport, UuidMessageIds,
};
use time_broker::infra::{InMemoryModelTransport, InMemoryReceiverTransport};
use time_broker::runtime::TokioSpawner;

fn config() -> BrokerConfig {
    let mut cfg = BrokerConfig::default();
    cfg.models.insert(
        "svm".to_string(),
        ModelConfig {
            endpoint: "127.0.0.1:7002".to_string(),
            attributes: [("gpu".to_string(), 1)].into_iter().collect(),
        },
    );
    cfg.default_receiver = Some("127.0.0.1:9000".to_string());
    cfg
}

#[tokio::test]
async fn test_build_dispatcher_with_factories() {
    let dispatcher = build_dispatcher(
        &config(),
        |_| Ok(Arc::new(InMemoryModelTransport::new()) as Arc<dyn ModelTransport>),
        |_| Ok(Arc::new(InMemoryReceiverTransport::new()) as Arc<dyn ReceiverTransport>),
        Arc::new(UuidMessageIds),
        TokioSpawner::current(),
    )
    .unwrap();

    assert!(dispatcher.tree().is_empty());
    assert_eq!(dispatcher.in_flight_len(), 0);
}

#[tokio::test]
async fn test_build_dispatcher_rejects_invalid_config() {
    let mut cfg = config();
    cfg.wake_queue_capacity = 0;

    let result = build_tcp_dispatcher(&cfg, TokioSpawner::current());
    assert!(matches!(result, Err(BrokerError::Config(_))));
}

#[tokio::test]
async fn test_build_dispatcher_propagates_factory_error() {
    let result = build_dispatcher(
        &config(),
        |_| Err(BrokerError::Transport("no route".to_string())),
        |_| Ok(Arc::new(InMemoryReceiverTransport::new()) as Arc<dyn ReceiverTransport>),
        Arc::new(UuidMessageIds),
        TokioSpawner::current(),
    );
    assert!(matches!(result, Err(BrokerError::Transport(_))));
}

#[test]
fn test_build_registry_from_config() {
    let registry = build_registry(&config());
    let svm = registry.get("svm").unwrap();

    assert_eq!(svm.endpoint.as_str(), "127.0.0.1:7002");
    assert_eq!(svm.attributes.get("gpu"), Some(&1));
    assert!(registry.get("bayes").is_none());
}
