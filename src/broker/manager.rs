//! Owner of the physical connection and session to the broker.

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BrokerError, Connector};
use crate::resilience::{CircuitState, ResiliencePolicy};

struct ManagerState<C: Connector> {
    connection: Option<C::Connection>,
    session: Option<C::Session>,
}

/// Owns one connection and one session over it.
///
/// Every producer and consumer built on the same manager shares that pair.
/// Reconnection is lazy: [`ensure_session`](Self::ensure_session) is called
/// before each broker operation, returns the open session on the fast path,
/// and otherwise rebuilds it inside the resilience policy.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: ResiliencePolicy,
    state: Mutex<ManagerState<C>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: ResiliencePolicy) -> Self {
        Self {
            connector,
            policy,
            state: Mutex::new(ManagerState {
                connection: None,
                session: None,
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.policy.circuit_state()
    }

    /// Return an open session, reconnecting if necessary.
    ///
    /// Fails with [`BrokerError::BrokenCircuit`] without touching the
    /// network while the circuit is open.
    pub async fn ensure_session(&self) -> Result<C::Session, BrokerError> {
        {
            let state = self.state.lock().await;
            if let Some(session) = state.session.as_ref() {
                if self.connector.is_session_open(session) {
                    return Ok(session.clone());
                }
            }
        }

        self.policy
            .execute("ensure_session", || self.connect_once())
            .await
    }

    /// One connect attempt: the unit retried by the policy.
    async fn connect_once(&self) -> Result<C::Session, BrokerError> {
        let mut state = self.state.lock().await;

        // Another caller may have reconnected while we waited on the lock.
        if let Some(session) = state.session.as_ref() {
            if self.connector.is_session_open(session) {
                return Ok(session.clone());
            }
        }

        if let Some(stale) = state.session.take() {
            debug!("Discarding half-open session");
            self.connector.close_session(stale).await;
        }

        let connection = match state.connection.take() {
            Some(connection) if self.connector.is_connection_open(&connection) => connection,
            stale => {
                if let Some(connection) = stale {
                    debug!("Discarding closed connection");
                    self.connector.close_connection(connection).await;
                }
                let connection = self.connector.connect().await?;
                info!("Connected to broker");
                connection
            }
        };

        let session = self.connector.open_session(&connection).await;
        state.connection = Some(connection);

        let session = session?;
        state.session = Some(session.clone());
        debug!("Opened broker session");
        Ok(session)
    }

    /// Release the session then the connection. Close errors are swallowed.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;

        if let Some(session) = state.session.take() {
            self.connector.close_session(session).await;
        }
        if let Some(connection) = state.connection.take() {
            self.connector.close_connection(connection).await;
            info!("Closed broker connection");
        }
    }
}
