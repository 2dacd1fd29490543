//! Reconnecting websocket transport.
//!
//! `SocketSession` owns one physical connection at a time and keeps it alive
//! with exponential backoff, forwarding raw inbound text frames and lifecycle
//! events to the caller. It is topic-agnostic: payloads pass through opaquely
//! and parsing stays with the listener.
//!
//! Send policy: frames submitted while the connection is not open are
//! silently dropped (logged at DEBUG). The subscription layer resynchronizes
//! its full topic set on every `Open`/`Reconnect` event, which reconciles any
//! frame lost to a drop.

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::retry::RetryPolicy;

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for a [`SocketSession`].
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// Websocket endpoint URL.
    pub endpoint: String,
    /// Optional API key sent as an `x-api-key` header during the handshake.
    pub api_key: Option<SecretString>,
    /// Reconnect backoff policy. `max_attempts` bounds the initial connect
    /// only; reconnects after a drop retry indefinitely until close.
    pub backoff: RetryPolicy,
}

impl SocketOptions {
    /// Creates options for the given endpoint with default backoff.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim().to_string(),
            api_key: None,
            backoff: RetryPolicy::reconnect(),
        }
    }

    /// Sets the API key forwarded in the websocket handshake.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Overrides the reconnect backoff policy.
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Lifecycle and data events produced by the socket worker.
#[derive(Debug)]
pub enum SocketEvent {
    /// First successful connect.
    Open,
    /// Successful connect after a previous connection was lost.
    Reconnect,
    /// Raw inbound text frame, forwarded without parsing.
    Frame(String),
    /// Connect failure or loss of an open connection.
    Error(SocketError),
}

/// Errors produced by the socket transport.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Websocket handshake or I/O error (includes malformed endpoint URLs).
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),

    /// The peer closed the connection.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// The socket session has been closed locally.
    #[error("socket session is closed")]
    SessionClosed,
}

/// Entry point for starting the reconnecting transport.
pub struct SocketSession;

impl SocketSession {
    /// Spawns the background worker that owns the websocket.
    ///
    /// The worker runs until every [`SocketSender`] is dropped or
    /// [`SocketHandle::close`] is called; a pending reconnect wait is
    /// cancelled by either.
    pub fn start(options: SocketOptions) -> SocketHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(socket_worker(options, outbound_rx, events_tx));

        SocketHandle {
            sender: SocketSender { tx: outbound_tx },
            events: events_rx,
        }
    }
}

/// Handle pair for an active socket worker.
#[derive(Debug)]
pub struct SocketHandle {
    sender: SocketSender,
    events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketHandle {
    /// Returns a cloneable sender for outbound text frames.
    pub fn sender(&self) -> SocketSender {
        self.sender.clone()
    }

    /// Splits into the outbound sender and the event receiver.
    pub fn split(self) -> (SocketSender, mpsc::UnboundedReceiver<SocketEvent>) {
        (self.sender, self.events)
    }

    /// Receives the next socket event. Returns `None` once the worker exits.
    pub async fn next_event(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    /// Terminates the connection and stops the worker. Idempotent: the
    /// worker also stops once all senders are dropped.
    pub fn close(self) {
        drop(self.sender);
    }
}

/// Cloneable handle for submitting outbound text frames.
#[derive(Clone, Debug)]
pub struct SocketSender {
    tx: mpsc::UnboundedSender<String>,
}

impl SocketSender {
    #[cfg(test)]
    pub(crate) fn from_raw(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Queues a text frame for the worker.
    ///
    /// Frames queued while no connection is open are dropped, not buffered.
    /// Fails only after the session has been closed.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SocketError> {
        self.tx
            .send(text.into())
            .map_err(|_| SocketError::SessionClosed)
    }
}

enum LinkOutcome {
    Shutdown,
    Lost(SocketError),
}

async fn socket_worker(
    options: SocketOptions,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
) {
    let mut ever_connected = false;
    let mut failed_attempts = 0usize;

    loop {
        match open_socket(&options).await {
            Ok(mut socket) => {
                failed_attempts = 0;
                drop_queued_frames(&mut outbound_rx);

                let event = if ever_connected {
                    SocketEvent::Reconnect
                } else {
                    SocketEvent::Open
                };
                ever_connected = true;
                if events_tx.send(event).is_err() {
                    let _ = socket.close(None).await;
                    return;
                }

                match drive_open_socket(&mut socket, &mut outbound_rx, &events_tx).await {
                    LinkOutcome::Shutdown => {
                        let _ = socket.close(None).await;
                        return;
                    }
                    LinkOutcome::Lost(error) => {
                        let _ = events_tx.send(SocketEvent::Error(error));
                    }
                }
            }
            Err(error) => {
                failed_attempts += 1;
                let exhausted = !ever_connected
                    && options.backoff.max_attempts > 0
                    && failed_attempts >= options.backoff.max_attempts;
                let _ = events_tx.send(SocketEvent::Error(error));
                if exhausted {
                    debug!(
                        event = "initial_connect_exhausted",
                        attempts = failed_attempts
                    );
                    return;
                }
            }
        }

        let delay = options.backoff.delay_for_attempt(failed_attempts.max(1));
        if !drop_frames_during_delay(delay, &mut outbound_rx).await {
            return;
        }
    }
}

async fn open_socket(options: &SocketOptions) -> Result<WsSocket, SocketError> {
    let mut request = options.endpoint.as_str().into_client_request()?;
    if let Some(api_key) = options.api_key.as_ref() {
        let header_value = api_key.expose_secret().parse()?;
        request.headers_mut().insert("x-api-key", header_value);
    }

    let (socket, _) = connect_async(request).await?;
    Ok(socket)
}

async fn drive_open_socket(
    socket: &mut WsSocket,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    events_tx: &mpsc::UnboundedSender<SocketEvent>,
) -> LinkOutcome {
    use futures_util::{SinkExt, StreamExt};

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if let Err(error) = socket.send(Message::Text(text.into())).await {
                            return LinkOutcome::Lost(SocketError::WebSocket(error));
                        }
                    }
                    None => return LinkOutcome::Shutdown,
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if events_tx.send(SocketEvent::Frame(text.as_str().to_owned())).is_err() {
                            return LinkOutcome::Shutdown;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(error) = socket.send(Message::Pong(payload)).await {
                            return LinkOutcome::Lost(SocketError::WebSocket(error));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        debug!(event = "ignored_binary_frame");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return LinkOutcome::Lost(SocketError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        return LinkOutcome::Lost(SocketError::WebSocket(error));
                    }
                }
            }
        }
    }
}

/// Discards frames queued before the connection opened, honoring the
/// documented drop-when-not-open policy. Runs before the `Open`/`Reconnect`
/// event is emitted so frames sent in reaction to it are never lost.
fn drop_queued_frames(outbound_rx: &mut mpsc::UnboundedReceiver<String>) {
    while let Ok(frame) = outbound_rx.try_recv() {
        debug!(event = "dropped_frame_while_disconnected", len = frame.len());
    }
}

/// Waits out a reconnect delay, discarding outbound frames in the meantime.
/// Returns `false` when the session closed during the wait.
async fn drop_frames_during_delay(
    delay: std::time::Duration,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_frame = outbound_rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        debug!(event = "dropped_frame_while_disconnected", len = frame.len());
                    }
                    None => return false,
                }
            }
        }
    }
}
