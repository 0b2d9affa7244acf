//! The application pipeline seam.
//!
//! Requests are the typed form of a message. The dispatcher hands each
//! mapped request to a [`CommandProcessor`]: commands go to `send`, events
//! to `publish`. What happens inside is the application's business.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

/// Access to `Any` for downcasting trait objects.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A typed application request (command or event).
pub trait Request: AsAny + Send + Sync + fmt::Debug + 'static {
    /// Identity shared with the message the request was mapped from.
    fn id(&self) -> Uuid;
}

impl dyn Request {
    pub fn downcast_ref<T: Request>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Request>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Handler outcome that decides whether a message is requeued or rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth another attempt; the message is requeued up to the limit.
    #[error("Transient handler failure: {0}")]
    Transient(String),

    /// Retrying will not help; the message is rejected.
    #[error("Handler failed: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Application command pipeline.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// Dispatch a command to its single handler.
    async fn send(&self, request: Box<dyn Request>) -> Result<(), HandlerError>;

    /// Broadcast an event to every subscribed handler.
    async fn publish(&self, request: Box<dyn Request>) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping(Uuid);

    impl Request for Ping {
        fn id(&self) -> Uuid {
            self.0
        }
    }

    #[derive(Debug)]
    struct Pong;

    impl Request for Pong {
        fn id(&self) -> Uuid {
            Uuid::nil()
        }
    }

    #[test]
    fn test_downcast_through_trait_object() {
        let id = Uuid::new_v4();
        let request: Box<dyn Request> = Box::new(Ping(id));

        assert!(request.is::<Ping>());
        assert_eq!(request.downcast_ref::<Ping>().map(|p| p.0), Some(id));
        assert!(request.downcast_ref::<Pong>().is_none());
    }

    #[test]
    fn test_transient_classification() {
        assert!(HandlerError::Transient("busy".into()).is_transient());
        assert!(!HandlerError::Fatal("bad input".into()).is_transient());
    }
}
