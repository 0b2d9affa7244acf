use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::connection::Connection;
use super::pump::{MessagePump, PumpExit};
use crate::processor::CommandProcessor;

/// Whether a performer is still pumping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Open,
    Shut,
}

/// Snapshot of one performer, as reported by `Dispatcher::consumers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Name of the connection the performer belongs to.
    pub name: String,
    pub performer: usize,
    pub state: ConsumerState,
}

/// A running performer owned by the dispatcher.
pub(crate) struct Consumer {
    name: String,
    performer: usize,
    cancel: watch::Sender<bool>,
    task: JoinHandle<PumpExit>,
}

impl Consumer {
    pub(crate) fn spawn(
        connection: &Connection,
        performer: usize,
        processor: Arc<dyn CommandProcessor>,
    ) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let pump = MessagePump::new(connection, performer, processor, cancel_rx);

        Self {
            name: connection.name().to_string(),
            performer,
            cancel,
            task: tokio::spawn(pump.run()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// A performer whose task has returned on its own is reported shut.
    pub(crate) fn state(&self) -> ConsumerState {
        if self.task.is_finished() {
            ConsumerState::Shut
        } else {
            ConsumerState::Open
        }
    }

    pub(crate) fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            name: self.name.clone(),
            performer: self.performer,
            state: self.state(),
        }
    }

    /// Signal the performer to stop and wait for it.
    ///
    /// Returns `None` if the task panicked.
    pub(crate) async fn shut(self) -> Option<PumpExit> {
        let _ = self.cancel.send(true);

        match self.task.await {
            Ok(exit) => {
                debug!(
                    connection = %self.name,
                    performer = self.performer,
                    exit = ?exit,
                    "Performer joined"
                );
                Some(exit)
            }
            Err(e) => {
                error!(
                    connection = %self.name,
                    performer = self.performer,
                    error = %e,
                    "Performer task panicked"
                );
                None
            }
        }
    }
}
