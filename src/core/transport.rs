//! Collaborator seams: outbound model calls, receiver forwarding, message ids.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::pipeline::RemoteModel;
use crate::core::BrokerError;
use crate::util::serde::{Endpoint, MessageId};

/// A due step as sent to its remote model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCall {
    /// Correlates the model's eventual response.
    pub message_id: MessageId,
    /// Name of the target model.
    pub model: String,
    /// Opaque step payload.
    pub payload: serde_json::Value,
    /// Where the model's output should finally go.
    pub receiver: Endpoint,
}

/// A remote model's answer, routed back through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Identifier issued when the step was dispatched.
    pub message_id: MessageId,
    /// Output to forward.
    pub value: serde_json::Value,
    /// Final receiver of the output.
    pub receiver: Endpoint,
}

/// Delivers due steps to remote models.
///
/// One call per step; the connection lives only for that send. Retries, if
/// any, are the implementation's business.
#[async_trait]
pub trait ModelTransport: Send + Sync + 'static {
    /// Send `call` to `remote`.
    async fn send(&self, remote: &RemoteModel, call: &ModelCall) -> Result<(), BrokerError>;
}

/// Forwards model outputs to their final receivers.
#[async_trait]
pub trait ReceiverTransport: Send + Sync + 'static {
    /// Deliver `value` to `receiver`.
    async fn forward(
        &self,
        receiver: &Endpoint,
        value: &serde_json::Value,
    ) -> Result<(), BrokerError>;
}

/// Source of message identifiers, unique while a message is in flight.
pub trait MessageIdSource: Send + Sync + 'static {
    /// Produce a fresh identifier.
    fn next_id(&self) -> MessageId;
}

/// Random v4 UUID identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidMessageIds;

impl MessageIdSource for UuidMessageIds {
    fn next_id(&self) -> MessageId {
        Uuid::new_v4()
    }
}
