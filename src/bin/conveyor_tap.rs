//! conveyor-tap: logging consumer
//!
//! Subscribes to every configured connection and logs each message it
//! receives, then acknowledges it. Useful for watching traffic on a queue
//! without writing handlers.
//!
//! ## Architecture
//! ```text
//! [RabbitMQ queues] --(AMQP)--> [conveyor-tap] --> stdout
//! ```
//!
//! ## Configuration
//! - First argument: config file path (optional)
//! - CONVEYOR_CONFIG: config file path (optional)
//! - CONVEYOR__BROKER__URL etc.: overrides, `__` separated
//! - CONVEYOR_LOG: log filter (default: info)
//!
//! Every connection's `request_type` is served by a pass-through mapper.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use conveyor::channel::AmqpChannelFactory;
use conveyor::config::Config;
use conveyor::mapper::{MessageMapperRegistry, RawMessageMapper, RawRequest};
use conveyor::processor::{CommandProcessor, HandlerError, Request};
use conveyor::utils::bootstrap::init_tracing;
use conveyor::DispatchBuilder;

/// Logs each request body and reports success.
struct LoggingProcessor;

impl LoggingProcessor {
    fn log(kind: &str, request: &dyn Request) {
        match request.downcast_ref::<RawRequest>() {
            Some(raw) => match std::str::from_utf8(&raw.body) {
                Ok(body) => info!(
                    kind,
                    id = %raw.id,
                    topic = %raw.topic,
                    body,
                    "Received message"
                ),
                Err(_) => info!(
                    kind,
                    id = %raw.id,
                    topic = %raw.topic,
                    bytes = raw.body.len(),
                    "Received binary message"
                ),
            },
            None => info!(kind, id = %request.id(), request = ?request, "Received request"),
        }
    }
}

#[async_trait]
impl CommandProcessor for LoggingProcessor {
    async fn send(&self, request: Box<dyn Request>) -> Result<(), HandlerError> {
        Self::log("command", &*request);
        Ok(())
    }

    async fn publish(&self, request: Box<dyn Request>) -> Result<(), HandlerError> {
        Self::log("event", &*request);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if config.connections.is_empty() {
        return Err("conveyor-tap requires at least one entry under 'connections'".into());
    }

    let mut mappers = MessageMapperRegistry::new();
    for connection in &config.connections {
        mappers.register(connection.request_type.clone(), RawMessageMapper);
    }

    let dispatcher = DispatchBuilder::new()
        .command_processor(Arc::new(LoggingProcessor))
        .message_mappers(mappers)
        .channel_factory(Arc::new(AmqpChannelFactory::new(
            config.broker.clone(),
            config.resilience.clone(),
        )))
        .connections(config.connections.clone())
        .build()?;

    info!(
        broker = %config.broker.sanitized_url(),
        connections = ?dispatcher.connections(),
        "Starting conveyor-tap"
    );
    dispatcher.receive().await?;

    info!("conveyor-tap running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    dispatcher.end().await?;
    Ok(())
}
