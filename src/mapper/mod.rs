//! Translation between wire messages and typed requests.
//!
//! Each connection names a request type; the registry resolves that name to
//! the [`MessageMapper`] the performers use for every message they receive.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::message::Message;
use crate::processor::Request;

mod json;
mod raw;

pub use json::JsonMessageMapper;
pub use raw::{RawMessageMapper, RawRequest};

/// Errors raised while mapping.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("Failed to decode message {id}: {reason}")]
    Decode { id: Uuid, reason: String },

    #[error("Failed to encode request {id}: {reason}")]
    Encode { id: Uuid, reason: String },

    #[error("Mapper expected a {expected} request")]
    UnexpectedRequest { expected: &'static str },
}

/// Converts between a [`Message`] and one request type.
pub trait MessageMapper: Send + Sync {
    fn map_to_message(&self, request: &dyn Request) -> Result<Message, MappingError>;

    fn map_to_request(&self, message: &Message) -> Result<Box<dyn Request>, MappingError>;
}

/// Mappers keyed by request type name.
#[derive(Clone, Default)]
pub struct MessageMapperRegistry {
    mappers: HashMap<String, Arc<dyn MessageMapper>>,
}

impl MessageMapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `mapper` for `request_type`, replacing any earlier one.
    pub fn register(
        &mut self,
        request_type: impl Into<String>,
        mapper: impl MessageMapper + 'static,
    ) -> &mut Self {
        self.mappers.insert(request_type.into(), Arc::new(mapper));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, request_type: impl Into<String>, mapper: impl MessageMapper + 'static) -> Self {
        self.register(request_type, mapper);
        self
    }

    pub fn resolve(&self, request_type: &str) -> Option<Arc<dyn MessageMapper>> {
        self.mappers.get(request_type).cloned()
    }

    pub fn contains(&self, request_type: &str) -> bool {
        self.mappers.contains_key(request_type)
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

impl fmt::Debug for MessageMapperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.mappers.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("MessageMapperRegistry")
            .field("request_types", &types)
            .finish()
    }
}
