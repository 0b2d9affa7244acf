//! conveyor - broker-to-pipeline message dispatch
//!
//! Subscribes to broker queues, maps wire messages to typed requests and
//! hands them to an application command processor, acknowledging, requeueing
//! or rejecting each message by outcome.
//!
//! The moving parts, leaf to root:
//! - [`message`]: the header + body value type
//! - [`resilience`]: retry and circuit breaker around broker connects
//! - [`broker`]: connection manager owning the connection and session
//! - [`channel`]: producer/consumer capability over a queue (in-memory, AMQP)
//! - [`mapper`] / [`processor`]: the seams to application code
//! - [`dispatch`]: performers and the dispatcher that supervises them

pub mod broker;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod mapper;
pub mod message;
pub mod processor;
pub mod resilience;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use dispatch::{DispatchBuilder, DispatchError, Dispatcher, DispatcherState};
pub use message::{Message, MessageBody, MessageHeader, MessageType};
