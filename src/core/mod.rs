//! Core scheduling abstractions: pipelines, the schedule tree and the dispatcher.

pub mod audit;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod schedule_tree;
pub mod tracker;
pub mod transport;

pub use audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
pub use dispatcher::{
    poll_interval, Admission, Completion, Dispatcher, DispatcherConfig, DispatcherStats, Spawn,
};
pub use error::{AppResult, BrokerError};
pub use pipeline::{PipelineRequest, PipelineSchedule, RemoteModel, Step, StepRequest};
pub use schedule_tree::{Insertion, NodeRef, Popped, ScheduleTree, TreeNode};
pub use tracker::{TaskToken, TaskTracker};
pub use transport::{
    MessageIdSource, ModelCall, ModelResponse, ModelTransport, ReceiverTransport, UuidMessageIds,
};
