//! # Client Session
//!
//! One logical conversation session over the relay. The session identity
//! token outlives any individual connection: it is appended to the relay URL
//! on every dial so the relay (and the upstream service behind it) can
//! re-associate the new transport with prior session state.
//!
//! ## Connection lifecycle:
//! - `connect()` is idempotent while a connection task is live.
//! - On unexpected close the session re-dials after a fixed delay, forever,
//!   until `disconnect()` is called.
//! - `disconnect()` cancels the in-flight connection *and* any pending
//!   reconnect timer; no stale timer may fire after teardown.
//!
//! ## Frame handling:
//! Inbound text frames are parsed as [`ControlMessage`]s; parse failures are
//! logged and dropped without disturbing the connection. Parsed messages are
//! stamped with a local arrival time and appended, in arrival order, to the
//! session's message log. Binary frames pass through opaquely as
//! [`SessionEvent::Audio`]. Outbound sends while disconnected fail with a
//! warning and are never queued.

use crate::error::{RelayError, RelayResult};
use crate::message::{ControlMessage, LoggedMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Observable transport state, mirrored to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Events surfaced to the session's consumer, in occurrence order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// A parsed control message, already appended to the message log
    Control(LoggedMessage),
    /// An opaque binary frame (e.g. synthesized speech from upstream)
    Audio(Vec<u8>),
}

/// State shared between the session handle and its connection task.
struct SessionShared {
    state: Mutex<ConnectionState>,
    /// Writer for the current connection; `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    log: Mutex<Vec<LoggedMessage>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Wakes the connection task out of its select or reconnect sleep.
    shutdown: Notify,
    /// Set by `disconnect()`; distinguishes intentional teardown from an
    /// unexpected close.
    closing: AtomicBool,
}

impl SessionShared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }
}

/// A session-scoped connection to the relay with automatic reconnection.
pub struct ClientSession {
    relay_url: String,
    token: String,
    reconnect_delay: Duration,
    shared: Arc<SessionShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    /// Create a session for `token`. Returns the session handle and the
    /// receiving end of its event stream.
    pub fn new(
        relay_url: impl Into<String>,
        token: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            relay_url: relay_url.into(),
            token: token.into(),
            reconnect_delay,
            shared: Arc::new(SessionShared {
                state: Mutex::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                log: Mutex::new(Vec::new()),
                events: events_tx,
                shutdown: Notify::new(),
                closing: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        };
        (session, events_rx)
    }

    /// Start the connection task. A no-op while one is already running.
    pub fn connect(&self) {
        let mut task = self.task.lock().unwrap();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        self.shared.closing.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let relay_url = self.relay_url.clone();
        let token = self.token.clone();
        let delay = self.reconnect_delay;

        *task = Some(tokio::spawn(async move {
            Self::run(shared, relay_url, token, delay).await;
        }));
    }

    /// Tear the session down. Cancels the live connection and any pending
    /// reconnect timer; the session can be re-established with `connect()`.
    pub fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_one();
        *self.shared.outbound.lock().unwrap() = None;
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Send a binary audio payload. Returns false (with a warning) when the
    /// transport is not open; nothing is queued for later delivery.
    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.send_frame(Message::Binary(data))
    }

    /// Send a control message as a text frame. Same contract as
    /// [`send_binary`](Self::send_binary).
    pub fn send_control(&self, message: &ControlMessage) -> bool {
        self.send_frame(Message::Text(message.to_json()))
    }

    fn send_frame(&self, frame: Message) -> bool {
        let outbound = self.shared.outbound.lock().unwrap();
        match outbound.as_ref() {
            Some(tx) if self.state() == ConnectionState::Connected => tx.send(frame).is_ok(),
            _ => {
                warn!("transport not open, dropping outbound frame");
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    /// Snapshot of the message log, in arrival order.
    pub fn messages(&self) -> Vec<LoggedMessage> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn session_token(&self) -> &str {
        &self.token
    }

    /// The relay URL with the session token attached, rebuilt per attempt.
    fn connect_url(relay_url: &str, token: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(relay_url)?;
        url.query_pairs_mut().append_pair("session_id", token);
        Ok(url)
    }

    /// Supervision loop: dial, stream until the connection ends, then either
    /// stop (explicit disconnect) or sleep and re-dial.
    async fn run(shared: Arc<SessionShared>, relay_url: String, token: String, delay: Duration) {
        loop {
            shared.set_state(ConnectionState::Connecting);
            match Self::connect_once(&shared, &relay_url, &token).await {
                Ok(()) => {
                    debug!("connection task ending after explicit disconnect");
                }
                Err(e) => {
                    warn!(error = %e, "connection lost");
                    shared.set_state(ConnectionState::Error);
                }
            }

            *shared.outbound.lock().unwrap() = None;
            shared.set_state(ConnectionState::Disconnected);
            let _ = shared.events.send(SessionEvent::Disconnected);

            if shared.closing.load(Ordering::SeqCst) {
                break;
            }

            info!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shared.shutdown.notified() => break,
            }
        }
    }

    /// One connection's lifetime. `Ok(())` means teardown was requested
    /// locally; any transport failure or remote close returns `Err` so the
    /// supervisor schedules a retry.
    async fn connect_once(
        shared: &Arc<SessionShared>,
        relay_url: &str,
        token: &str,
    ) -> RelayResult<()> {
        let url = Self::connect_url(relay_url, token)?;
        let (ws, _) = connect_async(url.as_str()).await?;

        // The sender must be in place before the Connected event lands, or a
        // consumer reacting to it could race an immediate send into a warn.
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *shared.outbound.lock().unwrap() = Some(tx);

        info!("connected to relay");
        shared.set_state(ConnectionState::Connected);
        let _ = shared.events.send(SessionEvent::Connected);

        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => Self::record_text_frame(shared, &text),
                        Some(Ok(Message::Binary(data))) => {
                            let _ = shared.events.send(SessionEvent::Audio(data));
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "relay closed the connection");
                            return Err(RelayError::Transport("closed by relay".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(RelayError::Transport("connection closed".to_string()))
                        }
                    }
                }
                outbound = rx.recv() => {
                    match outbound {
                        Some(frame) => write.send(frame).await?,
                        // Sender cleared: local teardown in progress
                        None => return Ok(()),
                    }
                }
                _ = shared.shutdown.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Parse an inbound text frame and append it to the message log.
    /// Malformed frames are dropped; the connection stays open.
    fn record_text_frame(shared: &Arc<SessionShared>, text: &str) {
        match ControlMessage::parse(text) {
            Ok(message) => {
                debug!(kind = message.kind(), "control message received");
                let entry = LoggedMessage::received(message);
                shared.log.lock().unwrap().push(entry.clone());
                let _ = shared.events.send(SessionEvent::Control(entry));
            }
            Err(e) => {
                warn!(error = %e, "dropping unparseable inbound frame");
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    fn shared_for_test() -> (Arc<SessionShared>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            state: Mutex::new(ConnectionState::Disconnected),
            outbound: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            events: events_tx,
            shutdown: Notify::new(),
            closing: AtomicBool::new(false),
        });
        (shared, events_rx)
    }

    #[test]
    fn test_connect_url_carries_session_token() {
        let url = ClientSession::connect_url("ws://localhost:3001/ws", "abc-123").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3001/ws?session_id=abc-123");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_without_queueing() {
        let (session, _events) =
            ClientSession::new("ws://localhost:9", "tok", Duration::from_secs(3));

        assert!(!session.send_binary(vec![1, 2, 3]));
        assert!(!session.send_control(&ControlMessage::stop_recording()));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_parse_failures_are_dropped_and_order_preserved() {
        let (shared, mut events) = shared_for_test();

        ClientSession::record_text_frame(&shared, r#"{"type":"system","message":"one"}"#);
        ClientSession::record_text_frame(&shared, "garbage {{{");
        ClientSession::record_text_frame(&shared, r#"{"type":"status","message":"two"}"#);

        let log = shared.log.lock().unwrap().clone();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, ControlMessage::system("one"));
        assert_eq!(log[1].message.kind(), "status");
        assert!(log[0].received_at <= log[1].received_at);

        // Events mirror the log, dropped frame absent
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Control(_))));
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Control(_))));
        assert!(events.try_recv().is_err());
    }

    /// Accept `count` connections, record each request URI, and close the
    /// socket immediately so the client sees an unexpected drop.
    async fn drop_server(
        listener: tokio::net::TcpListener,
        count: usize,
        uri_tx: mpsc::UnboundedSender<String>,
    ) {
        for _ in 0..count {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let tx = uri_tx.clone();
            let callback = move |req: &Request, resp: Response| {
                let _ = tx.send(req.uri().to_string());
                Ok(resp)
            };
            if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                drop(ws);
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_unexpected_close_reuses_token() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, mut uri_rx) = mpsc::unbounded_channel();
        tokio::spawn(drop_server(listener, 2, uri_tx));

        let (session, _events) = ClientSession::new(
            format!("ws://{}/ws", addr),
            "abc-123",
            Duration::from_millis(50),
        );
        session.connect();

        let first = tokio::time::timeout(Duration::from_secs(5), uri_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), uri_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(first.contains("session_id=abc-123"));
        assert_eq!(first, second);
        session.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_reconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, mut uri_rx) = mpsc::unbounded_channel();
        tokio::spawn(drop_server(listener, 8, uri_tx));

        let (session, _events) = ClientSession::new(
            format!("ws://{}/ws", addr),
            "tok",
            Duration::from_millis(200),
        );
        session.connect();

        // First dial lands, then the server drops it and the session enters
        // its reconnect delay. Disconnecting inside that window must cancel
        // the pending attempt.
        let _first = tokio::time::timeout(Duration::from_secs(5), uri_rx.recv())
            .await
            .unwrap()
            .unwrap();
        session.disconnect();

        let extra = tokio::time::timeout(Duration::from_millis(600), uri_rx.recv()).await;
        assert!(extra.is_err(), "no dial may happen after disconnect()");
    }

    #[tokio::test]
    async fn test_inbound_system_message_lands_in_log_with_timestamp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"system","message":"ready"}"#.to_string(),
            ))
            .await
            .unwrap();
            // Hold the connection open until the client has seen the frame
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (session, mut events) = ClientSession::new(
            format!("ws://{}/ws", addr),
            "abc-123",
            Duration::from_secs(3),
        );
        session.connect();

        let entry = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::Control(entry) = event {
                break entry;
            }
        };

        assert_eq!(entry.message, ControlMessage::system("ready"));
        assert!(entry.received_at > 0);

        let log = session.messages();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], entry);

        session.disconnect();
    }
}
