//! Tests for audit sink

use std::sync::Arc;

use parking_lot::Mutex;
use time_broker::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};
use uuid::Uuid;

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);
    let pipeline = Uuid::new_v4();

    sink.record(build_audit_event(Some(pipeline), AuditAction::Admit, None));
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].pipeline, Some(pipeline));
    assert_eq!(events[0].action, AuditAction::Admit);
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event(None, AuditAction::Drop, Some("first".to_string())));
    sink.record(build_audit_event(None, AuditAction::Drop, Some("second".to_string())));
    sink.record(build_audit_event(None, AuditAction::Drop, Some("third".to_string())));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].detail.as_deref(), Some("second")); // oldest evicted
    assert_eq!(events[1].detail.as_deref(), Some("third"));
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event(None, AuditAction::Complete, Some("msg".to_string()));

    assert_eq!(event.pipeline, None);
    assert_eq!(event.action, AuditAction::Complete);
    assert_eq!(event.detail, Some("msg".to_string()));
    assert!(event.created_at_ms > 0);
}

#[test]
fn test_shared_sink_stays_inspectable() {
    let shared = Arc::new(Mutex::new(InMemoryAuditSink::new(4)));
    let mut handle = Arc::clone(&shared);

    handle.record(build_audit_event(None, AuditAction::Dispatch, None));
    assert_eq!(shared.lock().events().len(), 1);
}
