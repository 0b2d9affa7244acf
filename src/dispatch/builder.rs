use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::connection::Connection;
use super::dispatcher::Dispatcher;
use super::{DispatchError, Result};
use crate::channel::ChannelFactory;
use crate::config::ConnectionConfig;
use crate::mapper::MessageMapperRegistry;
use crate::processor::CommandProcessor;

/// Assembles a [`Dispatcher`] and validates its configuration.
///
/// ```ignore
/// let dispatcher = DispatchBuilder::new()
///     .command_processor(processor)
///     .message_mappers(registry)
///     .channel_factory(Arc::new(InMemoryChannelFactory::new()))
///     .connections(config.connections)
///     .build()?;
/// ```
#[derive(Default)]
pub struct DispatchBuilder {
    processor: Option<Arc<dyn CommandProcessor>>,
    mappers: Option<MessageMapperRegistry>,
    channel_factory: Option<Arc<dyn ChannelFactory>>,
    connections: Vec<ConnectionConfig>,
}

impl DispatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_processor<P: CommandProcessor + 'static>(mut self, processor: Arc<P>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn message_mappers(mut self, mappers: MessageMapperRegistry) -> Self {
        self.mappers = Some(mappers);
        self
    }

    pub fn channel_factory<F: ChannelFactory + 'static>(mut self, factory: Arc<F>) -> Self {
        self.channel_factory = Some(factory);
        self
    }

    pub fn connections(mut self, connections: Vec<ConnectionConfig>) -> Self {
        self.connections = connections;
        self
    }

    /// Validate the configuration and create one channel per connection.
    ///
    /// No performer starts and no broker I/O happens until
    /// [`Dispatcher::receive`].
    pub fn build(self) -> Result<Dispatcher> {
        let processor = self
            .processor
            .ok_or(DispatchError::MissingComponent("command processor"))?;
        let mappers = self
            .mappers
            .ok_or(DispatchError::MissingComponent("message mapper registry"))?;
        let factory = self
            .channel_factory
            .ok_or(DispatchError::MissingComponent("channel factory"))?;

        if self.connections.is_empty() {
            return Err(DispatchError::NoConnections);
        }

        let mut names = HashSet::new();
        let mut connections = Vec::with_capacity(self.connections.len());
        for config in &self.connections {
            if !names.insert(config.name.as_str()) {
                return Err(DispatchError::DuplicateConnection(config.name.clone()));
            }
            if config.performers == 0 {
                return Err(DispatchError::NoPerformers(config.name.clone()));
            }
            let mapper =
                mappers
                    .resolve(&config.request_type)
                    .ok_or_else(|| DispatchError::MissingMapper {
                        connection: config.name.clone(),
                        request_type: config.request_type.clone(),
                    })?;

            let channel = factory.create_input_channel(&config.binding())?;
            debug!(
                connection = %config.name,
                queue = %config.queue,
                performers = config.performers,
                "Configured connection"
            );
            connections.push(Connection::new(config, mapper, channel));
        }

        Ok(Dispatcher::new(processor, connections))
    }
}
