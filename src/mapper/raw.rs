use uuid::Uuid;

use super::{MappingError, MessageMapper};
use crate::message::{Message, MessageHeader, MessageType};
use crate::processor::Request;

/// A message body with its routing facts, uninterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub id: Uuid,
    pub topic: String,
    pub message_type: MessageType,
    pub body: Vec<u8>,
}

impl Request for RawRequest {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Pass-through mapper for consumers that only inspect or forward bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMessageMapper;

impl MessageMapper for RawMessageMapper {
    fn map_to_message(&self, request: &dyn Request) -> Result<Message, MappingError> {
        let raw = request
            .downcast_ref::<RawRequest>()
            .ok_or(MappingError::UnexpectedRequest {
                expected: "RawRequest",
            })?;
        Ok(Message::new(
            MessageHeader::new(raw.id, raw.topic.clone(), raw.message_type),
            raw.body.clone(),
        ))
    }

    fn map_to_request(&self, message: &Message) -> Result<Box<dyn Request>, MappingError> {
        Ok(Box::new(RawRequest {
            id: message.id(),
            topic: message.header.topic.clone(),
            message_type: message.header.message_type,
            body: message.body.as_bytes().to_vec(),
        }))
    }
}
