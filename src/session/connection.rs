//! Transport lifecycle for one engine connection.
//!
//! Owns the websocket and a readiness flag. Readiness means the engine has
//! acknowledged the session (first decoded `ReadyForQuery`), not merely that
//! the raw socket opened. The inbound event stream has a single consumer at a
//! time: [`Connection::attach`] hands it over, detaching whoever held it
//! before — that is how a fresh session machine takes ownership of the
//! socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error};
use url::Url;

use crate::protocol::{self, ClientRequest, ServerEvent};

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("invalid engine url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    out_tx: mpsc::UnboundedSender<ClientRequest>,
    subscriber: Arc<Mutex<mpsc::UnboundedSender<ServerEvent>>>,
    ready: Arc<AtomicBool>,
    task_handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Open the websocket and queue the one-time authentication payload.
    /// Returns before the engine acknowledges; poll [`Connection::is_ready`]
    /// or watch for the first `ReadyForQuery` on the attached stream.
    pub async fn connect(engine_url: &str, token: Option<&str>) -> Result<Self, ConnectionError> {
        let url = Url::parse(engine_url)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        debug!(target: "tidepool::connection", %url, "websocket open");

        let (out_tx, out_rx) = mpsc::unbounded_channel::<ClientRequest>();
        // Parked sender until someone attaches; events arriving before then
        // are dropped on the floor of a closed channel.
        let (event_tx, _unattached) = mpsc::unbounded_channel::<ServerEvent>();
        let subscriber = Arc::new(Mutex::new(event_tx));
        let ready = Arc::new(AtomicBool::new(false));

        if let Some(token) = token {
            out_tx
                .send(ClientRequest::Auth {
                    token: token.to_string(),
                })
                .map_err(|_| ConnectionError::Closed)?;
        }

        let task_handle = tokio::spawn(run_socket(
            ws_stream,
            out_rx,
            subscriber.clone(),
            ready.clone(),
        ));

        Ok(Self {
            out_tx,
            subscriber,
            ready,
            task_handle,
        })
    }

    /// Take ownership of the inbound event stream, replacing any previous
    /// subscriber (whose receiver simply dries up).
    pub fn attach(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        *self.subscriber.lock() = event_tx;
        event_rx
    }

    /// Queue a request for the socket task. Only meaningful once ready.
    pub fn send(&self, request: ClientRequest) -> Result<(), ConnectionError> {
        self.out_tx
            .send(request)
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Tear the transport down. Pending round-trips are abandoned; no
    /// synthetic error event is injected into the stream.
    pub async fn close(self) {
        self.ready.store(false, Ordering::SeqCst);
        // Dropping the outbound sender drains the writer, which closes the
        // socket; the reader then winds down on the close frame.
        drop(self.out_tx);
        let _ = self.task_handle.await;
    }
}

async fn run_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut out_rx: mpsc::UnboundedReceiver<ClientRequest>,
    subscriber: Arc<Mutex<mpsc::UnboundedSender<ServerEvent>>>,
    ready: Arc<AtomicBool>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(request) = out_rx.recv().await {
            match protocol::encode_request(&request) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(target: "tidepool::connection", %err, "dropping unencodable request");
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match protocol::decode_event(&text) {
                Ok(event) => {
                    if matches!(event, ServerEvent::ReadyForQuery)
                        && !ready.swap(true, Ordering::SeqCst)
                    {
                        debug!(target: "tidepool::connection", "engine acknowledged session");
                    }
                    // A send error just means the subscriber was replaced or
                    // dropped mid-flight.
                    let _ = subscriber.lock().send(event);
                }
                Err(err) => {
                    // Desync with the engine; surfacing it beats guessing.
                    error!(target: "tidepool::connection", %err, frame = %text, "undecodable engine frame");
                    break;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    ready.store(false, Ordering::SeqCst);
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_rejects_malformed_url() {
        let err = Connection::connect("not a url", None).await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn connect_surfaces_transport_refusal() {
        // Nothing listens on a reserved port; the dial must fail, not hang.
        let err = Connection::connect("ws://127.0.0.1:1/api/sql", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Connect(_)));
    }
}
