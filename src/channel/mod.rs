//! Producer/consumer channels over a broker queue.
//!
//! This module contains:
//! - `MessageProducer` / `MessageChannel` traits: the capability set every
//!   transport implements (send, receive, acknowledge, reject, requeue, purge)
//! - `ReceiveOutcome`: tagged result of a bounded-wait receive
//! - `ChannelFactory` trait: builds input channels from queue bindings
//! - Implementations: in-memory, AMQP (RabbitMQ)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::broker::BrokerError;
use crate::message::Message;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannelFactory, AmqpConnector, AmqpMessageConsumer, AmqpMessageProducer};
pub use memory::{InMemoryChannel, InMemoryChannelFactory};

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur during channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel failure: {0}")]
    Failure(#[from] BrokerError),

    #[error("Message {0} was not received from a channel (no delivery tag)")]
    NotDelivered(Uuid),

    #[error("Message encoding failed: {0}")]
    Codec(String),

    #[error("Channel closed: {0}")]
    Closed(String),
}

/// Outcome of [`MessageChannel::receive`].
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A message arrived and is now unacknowledged on this channel.
    Delivered(Message),
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The channel cannot talk to the broker.
    ChannelLost(ChannelError),
}

/// Queue name and routing key a channel consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ChannelBinding {
    pub queue: String,
    pub routing_key: String,
}

impl ChannelBinding {
    pub fn new(queue: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Publishes messages, routed by `message.header.topic`.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Consumes a single bound queue.
///
/// A received message stays unacknowledged until exactly one of
/// `acknowledge`, `reject` or `requeue` is called with it.
#[async_trait]
pub trait MessageChannel: MessageProducer {
    /// The queue binding this channel consumes.
    fn binding(&self) -> &ChannelBinding;

    /// Wait up to `timeout` for the next delivery.
    async fn receive(&self, timeout: Duration) -> ReceiveOutcome;

    async fn acknowledge(&self, message: &Message) -> Result<()>;

    async fn reject(&self, message: &Message, requeue: bool) -> Result<()>;

    /// Publish a copy with an incremented handled count to the back of the
    /// queue, then reject the original without broker requeue.
    async fn requeue(&self, message: &Message) -> Result<()>;

    async fn purge(&self) -> Result<()>;

    /// Release broker resources.
    async fn close(&self) {}
}

/// Builds input channels for connections.
pub trait ChannelFactory: Send + Sync {
    /// Create the channel for `binding`. No broker I/O happens here.
    fn create_input_channel(&self, binding: &ChannelBinding) -> Result<Arc<dyn MessageChannel>>;
}
