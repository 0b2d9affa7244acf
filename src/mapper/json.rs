use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{MappingError, MessageMapper};
use crate::message::{Message, MessageHeader, MessageType};
use crate::processor::Request;

/// Maps a serde request type to a JSON body.
pub struct JsonMessageMapper<T> {
    topic: String,
    message_type: MessageType,
    _request: PhantomData<fn() -> T>,
}

impl<T> JsonMessageMapper<T> {
    pub fn new(topic: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            topic: topic.into(),
            message_type,
            _request: PhantomData,
        }
    }

    pub fn command(topic: impl Into<String>) -> Self {
        Self::new(topic, MessageType::Command)
    }

    pub fn event(topic: impl Into<String>) -> Self {
        Self::new(topic, MessageType::Event)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T> MessageMapper for JsonMessageMapper<T>
where
    T: Request + Serialize + DeserializeOwned,
{
    fn map_to_message(&self, request: &dyn Request) -> Result<Message, MappingError> {
        let typed = request
            .downcast_ref::<T>()
            .ok_or(MappingError::UnexpectedRequest {
                expected: std::any::type_name::<T>(),
            })?;
        let body = serde_json::to_vec(typed).map_err(|e| MappingError::Encode {
            id: request.id(),
            reason: e.to_string(),
        })?;

        Ok(Message::new(
            MessageHeader::new(request.id(), self.topic.clone(), self.message_type),
            body,
        ))
    }

    fn map_to_request(&self, message: &Message) -> Result<Box<dyn Request>, MappingError> {
        let request: T =
            serde_json::from_slice(message.body.as_bytes()).map_err(|e| MappingError::Decode {
                id: message.id(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(request))
    }
}
