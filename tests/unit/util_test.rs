//! Tests for utility functions

use time_broker::util::{now_ms, Endpoint, PipelineId};

#[test]
fn test_endpoint_serializes_as_string() {
    let endpoint = Endpoint::new("127.0.0.1:9000");
    assert_eq!(serde_json::to_string(&endpoint).unwrap(), "\"127.0.0.1:9000\"");

    let parsed: Endpoint = serde_json::from_str("\"10.0.0.1:1\"").unwrap();
    assert_eq!(parsed.as_str(), "10.0.0.1:1");
    assert_eq!(parsed.to_string(), "10.0.0.1:1");
}

#[test]
fn test_endpoint_empty() {
    assert!(Endpoint::from("").is_empty());
    assert!(!Endpoint::from(String::from("a:1")).is_empty());
}

#[test]
fn test_pipeline_ids_are_unique() {
    let a: PipelineId = uuid::Uuid::new_v4();
    let b: PipelineId = uuid::Uuid::new_v4();
    assert_ne!(a, b);
}

#[test]
fn test_now_ms_is_positive() {
    assert!(now_ms() > 0);
}
