//! Channel message types.

use crate::context::{CallContext, Correlation};
use crate::error::ServiceError;
use crate::events::EventBus;
use crate::store::Record;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    /// Stable across redeliveries; handlers dedupe on it.
    pub id: Uuid,
    pub topic: String,
    pub payload: Record,
    pub correlation: Correlation,
    /// Delivery attempts so far, starting at 1 on first delivery.
    pub attempt: u32,
}

impl ChannelMessage {
    pub fn new(topic: impl Into<String>, payload: Record, correlation: Correlation) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            correlation,
            attempt: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    Published,
    Delivered,
    Completed,
    Failed,
}

/// Broadcast on every state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub message_id: Uuid,
    pub topic: String,
    pub state: MessageState,
    pub attempt: u32,
    pub error: Option<String>,
}

/// A message that will not be delivered again.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: ChannelMessage,
    pub error: ServiceError,
}

/// Explicit handler context for one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    /// Fresh context derived from the publisher's correlation.
    pub call: CallContext,
    pub message_id: Uuid,
    pub attempt: u32,
    pub events: EventBus,
}

impl DeliveryContext {
    pub fn new(message: &ChannelMessage, events: EventBus) -> Self {
        let call = CallContext::from_correlation(&message.correlation, "channel")
            .with_action(message.topic.clone());
        Self {
            call,
            message_id: message.id,
            attempt: message.attempt,
            events,
        }
    }

    /// Emits a follow-up domain event correlated with this delivery.
    pub fn emit(&self, name: impl Into<String>, payload: Value) -> usize {
        self.events.emit(name, payload, Some(self.call.correlation()))
    }
}

#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Errors classified retryable by [`ServiceError::is_retryable`] cause a
    /// redelivery; anything else fails the message for good.
    async fn handle(&self, ctx: DeliveryContext, message: ChannelMessage) -> Result<(), ServiceError>;
}
