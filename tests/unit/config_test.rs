//! Tests for configuration validation

use std::time::Duration;

use time_broker::config::{BrokerConfig, ModelConfig};

fn valid() -> BrokerConfig {
    BrokerConfig {
        submission_addrs: vec!["127.0.0.1:8000".to_string()],
        response_addrs: vec!["127.0.0.1:8001".to_string()],
        ..BrokerConfig::default()
    }
}

#[test]
fn test_broker_config_validation() {
    assert!(valid().validate().is_ok());
}

#[test]
fn test_broker_config_requires_listeners() {
    let mut cfg = valid();
    cfg.submission_addrs.clear();
    assert!(cfg.validate().is_err());

    let mut cfg = valid();
    cfg.response_addrs = vec!["  ".to_string()];
    assert!(cfg.validate().is_err());
}

#[test]
fn test_broker_config_invalid_poll_bounds() {
    let mut cfg = valid();
    cfg.min_poll_interval_ms = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = valid();
    cfg.min_poll_interval_ms = 50;
    cfg.max_poll_interval_ms = 10;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_broker_config_invalid_queue_capacity() {
    let mut cfg = valid();
    cfg.wake_queue_capacity = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_broker_config_rejects_zero_line_limit() {
    let mut cfg = valid();
    cfg.max_line_bytes = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_broker_config_model_without_endpoint() {
    let mut cfg = valid();
    cfg.models.insert(
        "svm".to_string(),
        ModelConfig {
            endpoint: String::new(),
            attributes: Default::default(),
        },
    );
    assert!(cfg.validate().is_err());
}

#[test]
fn test_broker_config_from_json_applies_defaults() {
    let json = r#"{
        "submission_addrs": ["0.0.0.0:8000"],
        "response_addrs": ["0.0.0.0:8001", "0.0.0.0:8002"],
        "models": {"svm": {"endpoint": "10.0.0.7:7000", "attributes": {"gpu": 1}}},
        "default_receiver": "10.0.0.9:9000"
    }"#;
    let cfg = BrokerConfig::from_json_str(json).unwrap();

    assert_eq!(cfg.response_addrs.len(), 2);
    assert_eq!(cfg.max_poll_interval_ms, 1_000);
    assert_eq!(cfg.min_poll_interval_ms, 1);
    assert_eq!(cfg.wake_queue_capacity, 10);
    assert_eq!(cfg.send_retries, 0);
    assert_eq!(cfg.response_grace_ms, 30_000);
    assert_eq!(cfg.max_line_bytes, 64 * 1024);
    assert!(cfg.worker_threads > 0);
    assert_eq!(cfg.models["svm"].attributes["gpu"], 1);
    assert_eq!(cfg.default_receiver.as_deref(), Some("10.0.0.9:9000"));
}

#[test]
fn test_broker_config_from_json_rejects_invalid() {
    assert!(BrokerConfig::from_json_str("{").is_err());
    assert!(BrokerConfig::from_json_str(r#"{"submission_addrs": [], "response_addrs": ["a:1"]}"#).is_err());
}

#[test]
fn test_dispatcher_config_conversion() {
    let mut cfg = valid();
    cfg.max_poll_interval_ms = 250;
    cfg.min_poll_interval_ms = 2;
    cfg.wake_queue_capacity = 4;

    let dispatcher = cfg.dispatcher_config();
    assert_eq!(dispatcher.max_poll_interval, Duration::from_millis(250));
    assert_eq!(dispatcher.min_poll_interval, Duration::from_millis(2));
    assert_eq!(dispatcher.wake_queue_capacity, 4);
    assert_eq!(dispatcher.response_grace, Duration::from_secs(30));
    assert_eq!(dispatcher.sweep_interval, Duration::from_millis(250));
    assert_eq!(cfg.connect_timeout(), Duration::from_millis(5_000));
}
