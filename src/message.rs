//! The value type moving through the dispatch pipeline.
//!
//! A [`Message`] is a header plus an opaque body. Everything except the
//! handled count is fixed at creation; the handled count is bumped each time
//! the message is requeued and drives the requeue-limit policy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of request a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Addressed to exactly one handler.
    Command,
    /// Broadcast to any number of handlers.
    Event,
    /// No message (the empty sentinel).
    #[default]
    None,
    /// Read from the wire but could not be understood.
    Unacceptable,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Event => "event",
            MessageType::None => "none",
            MessageType::Unacceptable => "unacceptable",
        }
    }

    /// Parse the wire form. Unknown values map to `Unacceptable`.
    pub fn parse(value: &str) -> Self {
        match value {
            "command" => MessageType::Command,
            "event" => MessageType::Event,
            "none" => MessageType::None,
            _ => MessageType::Unacceptable,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing and bookkeeping metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: Uuid,
    /// Routing key the message is published with.
    pub topic: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    /// Number of times this message has been requeued.
    pub handled_count: u32,
}

impl MessageHeader {
    pub fn new(id: Uuid, topic: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            id,
            topic: topic.into(),
            message_type,
            timestamp: Utc::now(),
            handled_count: 0,
        }
    }

    pub fn with_handled_count(mut self, handled_count: u32) -> Self {
        self.handled_count = handled_count;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Raw payload bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody(Vec<u8>);

impl MessageBody {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// UTF-8 view of the payload, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for MessageBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for MessageBody {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<String> for MessageBody {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&str> for MessageBody {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// A message on its way from the broker to a handler, or back.
///
/// Equality is structural over header and body. The delivery tag assigned by
/// the broker on receipt is transport bookkeeping and does not take part.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
    delivery_tag: Option<u64>,
}

impl Message {
    pub fn new(header: MessageHeader, body: impl Into<MessageBody>) -> Self {
        Self {
            header,
            body: body.into(),
            delivery_tag: None,
        }
    }

    /// The empty sentinel.
    pub fn empty() -> Self {
        Self::new(MessageHeader::new(Uuid::nil(), "", MessageType::None), MessageBody::default())
    }

    pub fn is_empty(&self) -> bool {
        self.header.message_type == MessageType::None
    }

    pub fn id(&self) -> Uuid {
        self.header.id
    }

    pub fn handled_count(&self) -> u32 {
        self.header.handled_count
    }

    pub fn increment_handled_count(&mut self) {
        self.header.handled_count = self.header.handled_count.saturating_add(1);
    }

    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }

    /// Attach the broker's delivery tag. Only channels call this.
    pub fn with_delivery_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = Some(tag);
        self
    }

    /// Copy suitable for re-publishing: same header and body, no delivery tag.
    pub fn detached(&self) -> Self {
        Self::new(self.header.clone(), self.body.clone())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.body == other.body
    }
}

impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(topic: &str, body: &str) -> Message {
        Message::new(
            MessageHeader::new(Uuid::new_v4(), topic, MessageType::Command),
            body,
        )
    }

    #[test]
    fn test_equality_ignores_delivery_tag() {
        let message = command("greeting", "hello");
        let delivered = message.clone().with_delivery_tag(42);

        assert_eq!(message, delivered);
        assert_eq!(delivered.delivery_tag(), Some(42));
        assert_eq!(delivered.detached().delivery_tag(), None);
    }

    #[test]
    fn test_equality_includes_handled_count() {
        let message = command("greeting", "hello");
        let mut requeued = message.clone();
        requeued.increment_handled_count();

        assert_ne!(message, requeued);
        assert_eq!(requeued.handled_count(), 1);
    }

    #[test]
    fn test_empty_sentinel() {
        assert!(Message::empty().is_empty());
        assert!(!command("greeting", "").is_empty());
    }

    #[test]
    fn test_message_type_wire_names() {
        for kind in [
            MessageType::Command,
            MessageType::Event,
            MessageType::None,
            MessageType::Unacceptable,
        ] {
            assert_eq!(MessageType::parse(kind.as_str()), kind);
        }
        assert_eq!(MessageType::parse("quit"), MessageType::Unacceptable);
    }

    #[test]
    fn test_body_utf8_view() {
        let body = MessageBody::from("test content");
        assert_eq!(body.as_str(), Some("test content"));

        let binary = MessageBody::from(vec![0xff, 0xfe]);
        assert_eq!(binary.as_str(), None);
    }
}
