//! In-memory transports for development and testing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::pipeline::RemoteModel;
use crate::core::transport::{MessageIdSource, ModelCall, ModelTransport, ReceiverTransport};
use crate::core::BrokerError;
use crate::util::serde::{Endpoint, MessageId};

/// A model call captured by [`InMemoryModelTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// When the send happened.
    pub at: Instant,
    /// Target model.
    pub remote: RemoteModel,
    /// The call as it would have gone on the wire.
    pub call: ModelCall,
}

/// Records model calls instead of sending them. Models listed as failing
/// produce a transport error.
#[derive(Debug, Clone, Default)]
pub struct InMemoryModelTransport {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryModelTransport {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `model` fail.
    pub fn fail_model(&self, model: impl Into<String>) {
        self.failing.lock().insert(model.into());
    }

    /// Calls recorded so far, in send order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ModelTransport for InMemoryModelTransport {
    async fn send(&self, remote: &RemoteModel, call: &ModelCall) -> Result<(), BrokerError> {
        if self.failing.lock().contains(&remote.name) {
            return Err(BrokerError::Transport(format!(
                "connection to {} refused",
                remote.endpoint
            )));
        }
        self.calls.lock().push(RecordedCall {
            at: Instant::now(),
            remote: remote.clone(),
            call: call.clone(),
        });
        Ok(())
    }
}

/// Records forwarded values per receiver.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReceiverTransport {
    forwarded: Arc<Mutex<Vec<(Endpoint, serde_json::Value)>>>,
}

impl InMemoryReceiverTransport {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Values forwarded so far, in order.
    pub fn forwarded(&self) -> Vec<(Endpoint, serde_json::Value)> {
        self.forwarded.lock().clone()
    }
}

#[async_trait]
impl ReceiverTransport for InMemoryReceiverTransport {
    async fn forward(
        &self,
        receiver: &Endpoint,
        value: &serde_json::Value,
    ) -> Result<(), BrokerError> {
        self.forwarded.lock().push((receiver.clone(), value.clone()));
        Ok(())
    }
}

/// Deterministic message ids counting up from 1.
#[derive(Debug, Default)]
pub struct SequentialMessageIds {
    next: AtomicU64,
}

impl MessageIdSource for SequentialMessageIds {
    fn next_id(&self) -> MessageId {
        Uuid::from_u128(u128::from(self.next.fetch_add(1, Ordering::Relaxed)) + 1)
    }
}
