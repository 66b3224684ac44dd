//! Audit trail of broker actions.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::clock::now_ms;
use crate::util::serde::PipelineId;

/// Broker action recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// Pipeline admitted into the schedule.
    Admit,
    /// Submission had no steps and was dropped.
    Drop,
    /// A step was sent to its model.
    Dispatch,
    /// A step could not be sent.
    DispatchFailed,
    /// A response was forwarded and correlated.
    Complete,
}

/// Audit event structure.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Pipeline concerned, if known.
    pub pipeline: Option<PipelineId>,
    /// Action taken.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// A sink shared with the caller, so recorded events stay inspectable.
impl<T: AuditSink> AuditSink for Arc<Mutex<T>> {
    fn record(&mut self, event: AuditEvent) {
        self.lock().record(event);
    }
}

/// Build an audit event stamped with the current wall-clock time.
pub fn build_audit_event(
    pipeline: Option<PipelineId>,
    action: AuditAction,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        pipeline,
        action,
        created_at_ms: now_ms(),
        detail,
    }
}
