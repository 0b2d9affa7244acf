//! Test utilities and doubles.
//!
//! Provides a spy command processor, sample command/event requests with
//! their mappers, and a polling helper for asserting on asynchronous
//! performer progress.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mapper::{JsonMessageMapper, MessageMapper, MessageMapperRegistry};
use crate::message::Message;
use crate::processor::{CommandProcessor, HandlerError, Request};

/// Request type name for [`MyCommand`].
pub const MY_COMMAND: &str = "my_command";
/// Request type name for [`MyEvent`].
pub const MY_EVENT: &str = "my_event";
/// Topic [`MyCommand`] messages are published with.
pub const MY_COMMAND_TOPIC: &str = "my.command";
/// Topic [`MyEvent`] messages are published with.
pub const MY_EVENT_TOPIC: &str = "my.event";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyCommand {
    pub id: Uuid,
    pub value: String,
}

impl MyCommand {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            value: value.into(),
        }
    }
}

impl Request for MyCommand {
    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyEvent {
    pub id: Uuid,
    pub value: String,
}

impl MyEvent {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            value: value.into(),
        }
    }
}

impl Request for MyEvent {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Registry with JSON mappers for [`MyCommand`] and [`MyEvent`].
pub fn mapper_registry() -> MessageMapperRegistry {
    MessageMapperRegistry::new()
        .with(MY_COMMAND, JsonMessageMapper::<MyCommand>::command(MY_COMMAND_TOPIC))
        .with(MY_EVENT, JsonMessageMapper::<MyEvent>::event(MY_EVENT_TOPIC))
}

/// A [`MyCommand`] message on [`MY_COMMAND_TOPIC`].
pub fn command_message(value: &str) -> Message {
    JsonMessageMapper::<MyCommand>::command(MY_COMMAND_TOPIC)
        .map_to_message(&MyCommand::new(value))
        .expect("MyCommand always serializes")
}

/// A [`MyEvent`] message on [`MY_EVENT_TOPIC`].
pub fn event_message(value: &str) -> Message {
    JsonMessageMapper::<MyEvent>::event(MY_EVENT_TOPIC)
        .map_to_message(&MyEvent::new(value))
        .expect("MyEvent always serializes")
}

/// How a request reached the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Sent,
    Published,
}

#[derive(Default)]
struct SpyState {
    received: Vec<(Dispatched, Uuid)>,
    failure: Option<HandlerError>,
    failures_remaining: Option<usize>,
}

/// Command processor that records every request it is given.
///
/// Configured failures are returned after the request is recorded, so
/// `received()` counts attempts, including ones that end in requeue.
#[derive(Default)]
pub struct SpyCommandProcessor {
    state: Mutex<SpyState>,
}

impl SpyCommandProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every request with `error`.
    pub fn set_failure(&self, error: HandlerError) {
        let mut state = self.lock();
        state.failure = Some(error);
        state.failures_remaining = None;
    }

    /// Fail the next `times` requests with `error`, then succeed.
    pub fn fail_times(&self, error: HandlerError, times: usize) {
        let mut state = self.lock();
        state.failure = Some(error);
        state.failures_remaining = Some(times);
    }

    pub fn clear_failure(&self) {
        let mut state = self.lock();
        state.failure = None;
        state.failures_remaining = None;
    }

    pub fn received(&self) -> Vec<(Dispatched, Uuid)> {
        self.lock().received.clone()
    }

    pub fn count(&self) -> usize {
        self.lock().received.len()
    }

    /// Requests seen with `id`, counting repeats.
    pub fn count_of(&self, id: Uuid) -> usize {
        self.lock()
            .received
            .iter()
            .filter(|(_, seen)| *seen == id)
            .count()
    }

    fn record(&self, how: Dispatched, request: &dyn Request) -> Result<(), HandlerError> {
        let mut state = self.lock();
        state.received.push((how, request.id()));

        let failure = state.failure.clone();
        match (failure, state.failures_remaining) {
            (None, _) => Ok(()),
            (Some(error), None) => Err(error),
            (Some(_), Some(0)) => {
                state.failure = None;
                state.failures_remaining = None;
                Ok(())
            }
            (Some(error), Some(remaining)) => {
                state.failures_remaining = Some(remaining - 1);
                Err(error)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CommandProcessor for SpyCommandProcessor {
    async fn send(&self, request: Box<dyn Request>) -> Result<(), HandlerError> {
        self.record(Dispatched::Sent, &*request)
    }

    async fn publish(&self, request: Box<dyn Request>) -> Result<(), HandlerError> {
        self.record(Dispatched::Published, &*request)
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
