//! Message dispatch: connections, performers and their supervisor.
//!
//! This module contains:
//! - `Dispatcher`: owns the connections and starts/stops their performers
//! - `DispatchBuilder`: validates configuration and builds a dispatcher
//! - `Connection`: a named queue subscription with N performers
//! - the performer pump that moves messages from a channel into the
//!   command processor

mod builder;
mod connection;
mod consumer;
mod dispatcher;
mod pump;

pub use builder::DispatchBuilder;
pub use connection::Connection;
pub use consumer::{ConsumerInfo, ConsumerState};
pub use dispatcher::{Dispatcher, DispatcherState};
pub use pump::PumpExit;

use crate::channel::ChannelError;

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised by the dispatcher and its builder.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Cannot {operation} while dispatcher is {state}")]
    InvalidState {
        operation: &'static str,
        state: DispatcherState,
    },

    #[error("Duplicate connection name: {0}")]
    DuplicateConnection(String),

    #[error("No message mapper registered for request type '{request_type}' (connection {connection})")]
    MissingMapper {
        connection: String,
        request_type: String,
    },

    #[error("Connection {0} has no performers")]
    NoPerformers(String),

    #[error("No connections configured")]
    NoConnections,

    #[error("Missing {0}")]
    MissingComponent(&'static str),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[cfg(test)]
mod tests;
