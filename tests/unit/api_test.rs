//! Tests for submission decoding

use std::time::Duration;

use time_broker::config::{BrokerConfig, ModelConfig};
use time_broker::core::{BrokerError, RemoteModel};
use time_broker::runtime::{decode_submission, ModelRegistry};

#[test]
fn test_registry_from_config_supplies_endpoint_and_receiver() {
    let mut cfg = BrokerConfig::default();
    cfg.models.insert(
        "bayes".to_string(),
        ModelConfig {
            endpoint: "10.0.0.3:7003".to_string(),
            attributes: Default::default(),
        },
    );
    cfg.default_receiver = Some("10.0.0.9:9000".to_string());
    let registry = ModelRegistry::from_config(&cfg);

    let request = decode_submission(r#"{"bayes":{"delay":25},"tloc":60}"#, &registry).unwrap();
    assert_eq!(request.steps[0].remote.endpoint.as_str(), "10.0.0.3:7003");
    assert_eq!(request.receiver.as_str(), "10.0.0.9:9000");
    assert_eq!(request.steps[0].delay, Duration::from_millis(25));
}

#[test]
fn test_inline_endpoint_needs_no_registry() {
    let registry = ModelRegistry::new();
    let request = decode_submission(
        r#"{"adhoc":{"delay":3,"endpoint":"127.0.0.1:1"},"tloc":5,"receiver":"127.0.0.1:2"}"#,
        &registry,
    )
    .unwrap();

    assert_eq!(
        request.steps[0].remote,
        RemoteModel::new("adhoc", "127.0.0.1:1")
    );
}

#[test]
fn test_empty_receiver_rejected() {
    let registry = ModelRegistry::new();
    let result = decode_submission(
        r#"{"adhoc":{"delay":3,"endpoint":"127.0.0.1:1"},"tloc":5,"receiver":""}"#,
        &registry,
    );
    assert!(matches!(result, Err(BrokerError::Decode(_))));
}
