//! Supervision of connections and their performers.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};

use super::connection::Connection;
use super::consumer::{Consumer, ConsumerInfo, ConsumerState};
use super::{DispatchError, Result};
use crate::processor::CommandProcessor;

/// Dispatcher lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Awaiting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatcherState::Awaiting => "awaiting",
            DispatcherState::Running => "running",
            DispatcherState::Stopping => "stopping",
            DispatcherState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct Inner {
    consumers: Vec<Consumer>,
}

/// Runs the performers for a fixed set of connections.
///
/// Control operations take `&self` and are serialized internally, so a
/// dispatcher can be shared behind an `Arc` while performers run. The
/// lifecycle state is kept outside that lock and stays readable while a
/// control operation is in progress.
pub struct Dispatcher {
    processor: Arc<dyn CommandProcessor>,
    connections: Vec<Connection>,
    inner: Mutex<Inner>,
    state: watch::Sender<DispatcherState>,
}

impl Dispatcher {
    pub(crate) fn new(processor: Arc<dyn CommandProcessor>, connections: Vec<Connection>) -> Self {
        Self {
            processor,
            connections,
            inner: Mutex::new(Inner {
                consumers: Vec::new(),
            }),
            state: watch::Sender::new(DispatcherState::Awaiting),
        }
    }

    /// Start every connection's performers, in configuration order.
    #[instrument(skip(self))]
    pub async fn receive(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match *self.state.borrow() {
            DispatcherState::Awaiting => {}
            DispatcherState::Running => return Ok(()),
            state => {
                return Err(DispatchError::InvalidState {
                    operation: "receive",
                    state,
                })
            }
        }

        for connection in &self.connections {
            self.spawn_performers(connection, &mut inner.consumers);
        }
        self.state.send_replace(DispatcherState::Running);

        info!(
            connections = self.connections.len(),
            consumers = inner.consumers.len(),
            "Dispatcher running"
        );
        Ok(())
    }

    /// Stop every performer of `name`. Other connections keep running.
    #[instrument(skip(self))]
    pub async fn shut(&self, name: &str) -> Result<()> {
        self.connection(name)?;

        let mut inner = self.inner.lock().await;
        let (shutting, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.consumers)
            .into_iter()
            .partition(|consumer| consumer.name() == name);
        inner.consumers = remaining;

        let count = shutting.len();
        join_all(shutting.into_iter().map(Consumer::shut)).await;

        info!(connection = %name, performers = count, "Connection shut");
        Ok(())
    }

    /// Restart the performers of `name` if none of them is running.
    #[instrument(skip(self))]
    pub async fn open(&self, name: &str) -> Result<()> {
        let connection = self.connection(name)?;

        let mut inner = self.inner.lock().await;
        let state = *self.state.borrow();
        if matches!(state, DispatcherState::Stopping | DispatcherState::Stopped) {
            return Err(DispatchError::InvalidState {
                operation: "open",
                state,
            });
        }

        let live = inner
            .consumers
            .iter()
            .any(|consumer| consumer.name() == name && consumer.state() == ConsumerState::Open);
        if live {
            return Ok(());
        }

        let (dead, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.consumers)
            .into_iter()
            .partition(|consumer| consumer.name() == name);
        inner.consumers = remaining;
        if !dead.is_empty() {
            warn!(connection = %name, performers = dead.len(), "Discarding failed performers");
            join_all(dead.into_iter().map(Consumer::shut)).await;
        }

        self.spawn_performers(connection, &mut inner.consumers);
        self.state.send_replace(DispatcherState::Running);

        info!(connection = %name, performers = connection.performer_count(), "Connection opened");
        Ok(())
    }

    /// Stop all performers, close every channel and enter `Stopped`.
    #[instrument(skip(self))]
    pub async fn end(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if *self.state.borrow() == DispatcherState::Stopped {
            return Ok(());
        }
        self.state.send_replace(DispatcherState::Stopping);

        let consumers = std::mem::take(&mut inner.consumers);
        info!(consumers = consumers.len(), "Dispatcher stopping");
        join_all(consumers.into_iter().map(Consumer::shut)).await;

        for connection in &self.connections {
            connection.channel().close().await;
        }

        self.state.send_replace(DispatcherState::Stopped);
        info!("Dispatcher stopped");
        Ok(())
    }

    /// Current lifecycle state. Does not wait for an in-progress `end`.
    pub async fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Receiver that observes every lifecycle transition.
    pub fn watch_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Snapshot of every performer the dispatcher currently owns.
    pub async fn consumers(&self) -> Vec<ConsumerInfo> {
        self.inner
            .lock()
            .await
            .consumers
            .iter()
            .map(Consumer::info)
            .collect()
    }

    /// Performers of `name` that are still pumping.
    pub async fn consumer_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .await
            .consumers
            .iter()
            .filter(|consumer| consumer.name() == name && consumer.state() == ConsumerState::Open)
            .count()
    }

    /// Connection names in configuration order.
    pub fn connections(&self) -> Vec<&str> {
        self.connections.iter().map(Connection::name).collect()
    }

    pub fn connection(&self, name: &str) -> Result<&Connection> {
        self.connections
            .iter()
            .find(|connection| connection.name() == name)
            .ok_or_else(|| DispatchError::UnknownConnection(name.to_string()))
    }

    fn spawn_performers(&self, connection: &Connection, consumers: &mut Vec<Consumer>) {
        for performer in 0..connection.performer_count() {
            consumers.push(Consumer::spawn(connection, performer, self.processor.clone()));
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}
