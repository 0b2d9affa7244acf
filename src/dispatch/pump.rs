//! The performer loop: receive, map, dispatch, settle.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use crate::channel::{ChannelError, MessageChannel, ReceiveOutcome};
use crate::mapper::MessageMapper;
use crate::message::{Message, MessageType};
use crate::processor::{CommandProcessor, HandlerError};

/// Why a performer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Asked to stop by the dispatcher.
    Cancelled,
    /// The channel reported the broker connection lost.
    ChannelFailed,
    /// Acknowledging, rejecting or requeueing a message failed.
    AcknowledgeFailed,
}

/// One performer's view of its connection.
pub(crate) struct MessagePump {
    connection: String,
    performer: usize,
    channel: Arc<dyn MessageChannel>,
    mapper: Arc<dyn MessageMapper>,
    processor: Arc<dyn CommandProcessor>,
    settings: Settings,
    cancel: watch::Receiver<bool>,
}

#[derive(Clone, Copy)]
struct Settings {
    receive_timeout: std::time::Duration,
    requeue_limit: u32,
}

impl MessagePump {
    pub(crate) fn new(
        connection: &Connection,
        performer: usize,
        processor: Arc<dyn CommandProcessor>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connection: connection.name().to_string(),
            performer,
            channel: connection.channel(),
            mapper: connection.mapper(),
            processor,
            settings: Settings {
                receive_timeout: connection.receive_timeout(),
                requeue_limit: connection.requeue_limit(),
            },
            cancel,
        }
    }

    /// Run until cancelled or the channel fails.
    ///
    /// Cancellation is only observed while waiting for a message. A message
    /// that has been received is always settled before the loop checks again.
    pub(crate) async fn run(mut self) -> PumpExit {
        info!(
            connection = %self.connection,
            performer = self.performer,
            queue = %self.channel.binding().queue,
            "Performer started"
        );

        let exit = loop {
            if *self.cancel.borrow() {
                break PumpExit::Cancelled;
            }

            let outcome = tokio::select! {
                biased;
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        break PumpExit::Cancelled;
                    }
                    continue;
                }
                outcome = self.channel.receive(self.settings.receive_timeout) => outcome,
            };

            match outcome {
                ReceiveOutcome::TimedOut => continue,
                ReceiveOutcome::ChannelLost(e) => {
                    error!(
                        connection = %self.connection,
                        performer = self.performer,
                        error = %e,
                        "Channel failed, performer stopping"
                    );
                    break PumpExit::ChannelFailed;
                }
                ReceiveOutcome::Delivered(message) => {
                    if let Err(e) = self.handle(message).await {
                        error!(
                            connection = %self.connection,
                            performer = self.performer,
                            error = %e,
                            "Failed to settle message, performer stopping"
                        );
                        break PumpExit::AcknowledgeFailed;
                    }
                }
            }
        };

        info!(
            connection = %self.connection,
            performer = self.performer,
            exit = ?exit,
            "Performer stopped"
        );
        exit
    }

    /// Map and dispatch one message, then acknowledge, requeue or reject it.
    async fn handle(&self, message: Message) -> Result<(), ChannelError> {
        let is_command = match message.header.message_type {
            MessageType::Command => true,
            MessageType::Event => false,
            MessageType::None | MessageType::Unacceptable => {
                warn!(
                    connection = %self.connection,
                    message_id = %message.id(),
                    message_type = %message.header.message_type,
                    "Rejecting message with no routable request"
                );
                return self.channel.reject(&message, false).await;
            }
        };

        let request = match self.mapper.map_to_request(&message) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    connection = %self.connection,
                    message_id = %message.id(),
                    error = %e,
                    "Failed to map message, rejecting"
                );
                return self.channel.reject(&message, false).await;
            }
        };

        debug!(
            connection = %self.connection,
            performer = self.performer,
            message_id = %message.id(),
            handled_count = message.handled_count(),
            "Dispatching request"
        );

        let result = if is_command {
            self.processor.send(request).await
        } else {
            self.processor.publish(request).await
        };

        match result {
            Ok(()) => self.channel.acknowledge(&message).await,
            Err(HandlerError::Transient(reason))
                if message.handled_count() < self.settings.requeue_limit =>
            {
                warn!(
                    connection = %self.connection,
                    message_id = %message.id(),
                    handled_count = message.handled_count(),
                    reason = %reason,
                    "Handler failed transiently, requeueing"
                );
                self.channel.requeue(&message).await
            }
            Err(e) => {
                error!(
                    connection = %self.connection,
                    message_id = %message.id(),
                    handled_count = message.handled_count(),
                    error = %e,
                    "Handler failed, rejecting message"
                );
                self.channel.reject(&message, false).await
            }
        }
    }
}
