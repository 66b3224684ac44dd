//! Error types for broker operations.

use thiserror::Error;

use crate::util::serde::PipelineId;

/// Errors produced by broker components.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A submission declared no steps; nothing can be scheduled.
    #[error("pipeline has no steps")]
    EmptyPipeline,
    /// A step was popped from a pipeline whose steps were all consumed.
    #[error("pipeline already exhausted")]
    AlreadyEmpty,
    /// The node is not (or no longer) linked into the schedule tree.
    #[error("pipeline {0} is not scheduled")]
    NotScheduled(PipelineId),
    /// Inbound payload could not be decoded.
    #[error("malformed submission: {0}")]
    Decode(String),
    /// Outbound connection or write failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The dispatch loop was started twice.
    #[error("dispatch loop already running")]
    AlreadyRunning,
    /// The dispatch loop's wake queue is gone.
    #[error("wake queue closed")]
    WakeQueueClosed,
    /// Invalid broker configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A configured listener address could not be bound.
    #[error("failed to bind {addr}: {reason}")]
    Bind {
        /// Address that failed.
        addr: String,
        /// Underlying cause.
        reason: String,
    },
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
