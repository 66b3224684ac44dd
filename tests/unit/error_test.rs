//! Tests for error types

use time_broker::core::BrokerError;

#[test]
fn test_empty_pipeline_error() {
    let err = BrokerError::EmptyPipeline;
    assert_eq!(format!("{}", err), "pipeline has no steps");
}

#[test]
fn test_already_empty_error() {
    let err = BrokerError::AlreadyEmpty;
    assert_eq!(format!("{}", err), "pipeline already exhausted");
}

#[test]
fn test_decode_error() {
    let err = BrokerError::Decode("missing `tloc`".to_string());
    assert_eq!(format!("{}", err), "malformed submission: missing `tloc`");
}

#[test]
fn test_transport_error() {
    let err = BrokerError::Transport("connection refused".to_string());
    assert_eq!(format!("{}", err), "transport error: connection refused");
}

#[test]
fn test_bind_error() {
    let err = BrokerError::Bind {
        addr: "127.0.0.1:8000".to_string(),
        reason: "address in use".to_string(),
    };
    assert_eq!(format!("{}", err), "failed to bind 127.0.0.1:8000: address in use");
}

#[test]
fn test_error_converts_to_anyhow() {
    fn fails() -> time_broker::core::AppResult<()> {
        let sent: Result<(), BrokerError> = Err(BrokerError::WakeQueueClosed);
        sent?;
        Ok(())
    }
    let err = fails().unwrap_err();
    assert_eq!(err.to_string(), "wake queue closed");
    assert!(err.downcast_ref::<BrokerError>().is_some());
}
