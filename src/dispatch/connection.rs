use std::sync::Arc;
use std::time::Duration;

use crate::channel::{ChannelBinding, MessageChannel};
use crate::config::ConnectionConfig;
use crate::mapper::MessageMapper;

/// A named subscription: one queue, one request type, N performers.
///
/// Every performer of a connection shares its channel. The channel outlives
/// `shut`/`open` cycles and is closed when the dispatcher ends.
pub struct Connection {
    name: String,
    binding: ChannelBinding,
    request_type: String,
    performer_count: usize,
    receive_timeout: Duration,
    requeue_limit: u32,
    mapper: Arc<dyn MessageMapper>,
    channel: Arc<dyn MessageChannel>,
}

impl Connection {
    pub(crate) fn new(
        config: &ConnectionConfig,
        mapper: Arc<dyn MessageMapper>,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            binding: config.binding(),
            request_type: config.request_type.clone(),
            performer_count: config.performers,
            receive_timeout: config.receive_timeout(),
            requeue_limit: config.requeue_limit,
            mapper,
            channel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    pub fn performer_count(&self) -> usize {
        self.performer_count
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub fn requeue_limit(&self) -> u32 {
        self.requeue_limit
    }

    pub fn channel(&self) -> Arc<dyn MessageChannel> {
        self.channel.clone()
    }

    pub(crate) fn mapper(&self) -> Arc<dyn MessageMapper> {
        self.mapper.clone()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("binding", &self.binding)
            .field("request_type", &self.request_type)
            .field("performer_count", &self.performer_count)
            .field("receive_timeout", &self.receive_timeout)
            .field("requeue_limit", &self.requeue_limit)
            .finish_non_exhaustive()
    }
}
