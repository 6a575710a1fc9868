//! One logical, authenticated session against the streaming SQL engine.
//!
//! [`SqlSession`] wires the connection manager, the protocol state machine,
//! and the transcript store together. All inbound events are serialized
//! through a single driver task; user submissions are guarded by the
//! machine's idle check, so at most one command is ever in flight.

pub mod connection;
pub mod diff;
pub mod history;
pub mod machine;

pub use connection::{Connection, ConnectionError};
pub use diff::{DiffError, MaterializedRows};
pub use history::{HistoryItem, HistoryStore, MaterializedOutput, Subscription};
pub use machine::{
    CommandOutput, CommandResult, Effect, HistoryId, NoticeOutput, ProtocolViolation, ResultShape,
    SessionMachine, SessionState,
};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::protocol::{ClientRequest, ServerEvent, Statement};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub engine_url: String,
    pub token: Option<String>,
}

impl From<Config> for SessionOptions {
    fn from(config: Config) -> Self {
        Self {
            engine_url: config.engine_url,
            token: config.token,
        }
    }
}

struct Shared {
    machine: Mutex<SessionMachine>,
    history: HistoryStore,
}

pub struct SqlSession {
    options: SessionOptions,
    shared: Arc<Shared>,
    connection: Mutex<Option<Connection>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SqlSession {
    /// Open the transport and start the event driver. Readiness follows the
    /// engine's first `ReadyForQuery`, shortly after this returns.
    pub async fn connect(options: SessionOptions) -> Result<Self, SessionError> {
        let session = Self {
            options,
            shared: Arc::new(Shared {
                machine: Mutex::new(SessionMachine::new()),
                history: HistoryStore::new(),
            }),
            connection: Mutex::new(None),
            driver: Mutex::new(None),
        };
        session.open().await?;
        Ok(session)
    }

    async fn open(&self) -> Result<(), SessionError> {
        let connection =
            Connection::connect(&self.options.engine_url, self.options.token.as_deref()).await?;
        let events = connection.attach();
        // A fresh machine takes ownership of the socket; any state from a
        // previous connection is gone with it.
        *self.shared.machine.lock() = SessionMachine::new();
        let driver = tokio::spawn(drive(self.shared.clone(), events));
        *self.connection.lock() = Some(connection);
        *self.driver.lock() = Some(driver);
        Ok(())
    }

    /// True once the engine has acknowledged the session.
    pub fn is_ready(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.is_ready())
    }

    /// Submit one command (possibly multiple semicolon-separated statements).
    /// Fire-and-forget: the returned id addresses the transcript entry that
    /// will fill in as events arrive. `None` when the session is not idle —
    /// submissions are never queued.
    pub fn submit(&self, command: &str) -> Option<HistoryId> {
        self.submit_inner(
            command.to_string(),
            ClientRequest::Simple {
                query: command.to_string(),
            },
        )
    }

    /// Multi-statement form with optional per-statement text parameters.
    pub fn submit_extended(&self, statements: Vec<Statement>) -> Option<HistoryId> {
        if statements.is_empty() {
            return None;
        }
        let display = statements
            .iter()
            .map(|statement| statement.query.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        self.submit_inner(display, ClientRequest::Extended { queries: statements })
    }

    fn submit_inner(&self, display: String, request: ClientRequest) -> Option<HistoryId> {
        let connection = self.connection.lock();
        let connection = connection.as_ref()?;
        if !connection.is_ready() {
            debug!(target: "tidepool::session", "submit ignored, engine not ready");
            return None;
        }
        let mut machine = self.shared.machine.lock();
        let (next, output) = machine.submit(&display)?;
        let history_id = output.history_id;
        // The wire send and the state change go together: no event can be
        // observed in the sent state before the round-trip has begun.
        if connection.send(request).is_err() {
            warn!(target: "tidepool::session", "connection closed, submission dropped");
            return None;
        }
        self.shared.history.commit(HistoryItem::Command(output));
        *machine = next;
        Some(history_id)
    }

    /// Abandon whatever is in flight (including a live subscription) by
    /// resetting the transport, then reconnect. Accumulated rows stay in the
    /// transcript; the merged view is recomputable from that retained log.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        let connection = self.connection.lock().take();
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.open().await
    }

    /// Close the session for good.
    pub async fn close(self) {
        let connection = self.connection.lock().take();
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    pub fn transcript(&self) -> Vec<HistoryItem> {
        self.shared.history.transcript()
    }

    pub fn materialized(
        &self,
        id: &HistoryId,
    ) -> Result<Option<MaterializedOutput>, DiffError> {
        self.shared.history.materialized(id)
    }

    pub fn on_history_changed(
        &self,
        callback: impl Fn(HistoryId) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.history.on_changed(callback)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.shared.history.unsubscribe(subscription);
    }
}

/// Single entry point feeding engine events into the machine. Processes one
/// event to completion before admitting the next; there is no other mutation
/// path.
async fn drive(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        let effect = {
            let mut machine = shared.machine.lock();
            match machine.apply(event) {
                Ok(transition) => {
                    *machine = transition.machine;
                    transition.effect
                }
                Err(violation) => {
                    // Desync with the engine. Stop consuming; the machine is
                    // stuck outside the idle state so no new work is
                    // accepted until the session is cancelled or reopened.
                    error!(target: "tidepool::session", %violation, "protocol desynchronization");
                    break;
                }
            }
        };
        match effect {
            Effect::None => {}
            Effect::Standalone(output) => {
                shared.history.commit(HistoryItem::Notice(output));
            }
            Effect::Updated(output) | Effect::Finished(output) => {
                shared.history.update(HistoryItem::Command(output));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_come_from_config() {
        let config = Config {
            engine_url: "wss://engine.example.com/api/sql".into(),
            token: Some("secret".into()),
        };
        let options = SessionOptions::from(config);
        assert_eq!(options.engine_url, "wss://engine.example.com/api/sql");
        assert_eq!(options.token.as_deref(), Some("secret"));
    }

    #[test]
    fn extended_submit_rejects_empty_batch() {
        // No connection at all: the guard path must not panic.
        let session_options = SessionOptions {
            engine_url: "ws://127.0.0.1:1".into(),
            token: None,
        };
        let session = SqlSession {
            options: session_options,
            shared: Arc::new(Shared {
                machine: Mutex::new(SessionMachine::new()),
                history: HistoryStore::new(),
            }),
            connection: Mutex::new(None),
            driver: Mutex::new(None),
        };
        assert!(session.submit_extended(Vec::new()).is_none());
        assert!(session.submit("SELECT 1").is_none());
        assert!(!session.is_ready());
    }
}
