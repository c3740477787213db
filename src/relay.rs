//! # Session Relay
//!
//! Pairs each inbound client WebSocket with exactly one outbound connection
//! to the upstream AI service and forwards frames verbatim in both
//! directions. Clients connect to `/ws`, optionally with a `session_id`
//! query parameter that is passed through to the upstream service so it can
//! resume session-scoped state.
//!
//! ## Connection lifecycle:
//! 1. **Accepting**: upgrade accepted, origin checked, `session_id` extracted
//! 2. **Pairing**: outbound connection opened with the session token attached
//! 3. **Paired**: bidirectional forwarding, frame boundaries and order kept
//! 4. **Draining**: either side closes or errors; the Pairing is dropped and
//!    the other side is cleaned up
//!
//! The relay never looks inside audio or control payloads: all semantic
//! handling happens upstream or in the client. The only messages it
//! originates are the `system` notice when the upstream link opens and a
//! single `error` notice when the upstream is unavailable; reconnecting is
//! the client's job, by dialing in again.
//!
//! ## Actor Model:
//! Each inbound connection is an independent Actix actor owning its
//! [`Pairing`] record. The record holds the upstream command channel and the
//! reader/writer task handles, so teardown cancels everything in one place
//! and no per-connection state leaks across handlers.

use crate::message::ControlMessage;
use crate::state::AppState;
use actix::fut::wrap_future;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

/// How often the relay pings an idle inbound connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Inbound connections silent for this long are considered gone.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// The live association between one inbound connection and its upstream
/// counterpart.
///
/// Owns the only sender into the upstream writer task plus both task
/// handles. Frames pass through a single FIFO channel per direction, which
/// is what preserves per-direction ordering.
struct Pairing {
    to_upstream: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
    /// Ends on its own once `to_upstream` is dropped; kept for completeness
    /// of ownership, not for aborting.
    _writer: JoinHandle<()>,
}

impl Pairing {
    /// Forward one frame verbatim. False when the upstream writer is gone.
    fn forward(&self, frame: WsMessage) -> bool {
        self.to_upstream.send(frame).is_ok()
    }

    /// Tear the upstream side down: stop reading immediately and let the
    /// writer drain, send a Close frame, and exit.
    fn shutdown(self) {
        self.reader.abort();
        drop(self.to_upstream);
    }
}

/// Append the session token to the upstream endpoint, when present.
fn build_upstream_url(base: &str, session_id: Option<&str>) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    if let Some(session_id) = session_id {
        url.query_pairs_mut().append_pair("session_id", session_id);
    }
    Ok(url)
}

// Internal actor messages bridging the upstream tasks back into the actor.

#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamReady {
    to_upstream: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamFrame(WsMessage);

#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamGone {
    failed: bool,
}

/// Actor owning one inbound connection and its Pairing.
pub struct RelaySession {
    /// Session token extracted from the inbound request, if any
    session_id: Option<String>,

    /// Upstream endpoint, read from config at accept time
    upstream_url: String,

    /// Shared counters; the only state that crosses connections
    state: AppState,

    /// Present exactly while both sides are open
    pairing: Option<Pairing>,

    /// Guards the single synthesized upstream-unavailable notice
    upstream_notice_sent: bool,

    last_heartbeat: Instant,
}

impl RelaySession {
    pub fn new(session_id: Option<String>, upstream_url: String, state: AppState) -> Self {
        Self {
            session_id,
            upstream_url,
            state,
            pairing: None,
            upstream_notice_sent: false,
            last_heartbeat: Instant::now(),
        }
    }

    /// Forward an inbound frame to the upstream side of the Pairing.
    /// Frames that arrive before the Pairing is up (or after it went down)
    /// are dropped; forwarding only happens while both sides are open.
    fn forward_inbound(&mut self, frame: WsMessage) {
        match &self.pairing {
            Some(pairing) => {
                if !pairing.forward(frame) {
                    warn!("upstream writer gone, dropping inbound frame");
                }
            }
            None => {
                debug!("no active pairing, dropping inbound frame");
            }
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("client heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }
}

/// Dial the upstream service and wire its stream halves to the actor.
///
/// The writer owns the sink half and drains a FIFO channel; the reader owns
/// the stream half and reports frames (and the eventual close or error) back
/// to the actor. Exactly one `UpstreamGone` is emitted per connection
/// attempt.
async fn connect_upstream(url: Url, addr: Addr<RelaySession>) {
    info!(url = %url, "connecting to upstream service");

    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(error = %e, "failed to connect to upstream service");
            addr.do_send(UpstreamGone { failed: true });
            return;
        }
    };

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.send(frame).await.is_err() {
                return;
            }
        }
        // Channel closed: the Pairing was torn down, close upstream so no
        // orphaned connection lingers.
        let _ = write.send(WsMessage::Close(None)).await;
    });

    let pong_tx = tx.clone();
    let reader_addr = addr.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(frame @ WsMessage::Text(_)) | Ok(frame @ WsMessage::Binary(_)) => {
                    reader_addr.do_send(UpstreamFrame(frame));
                }
                Ok(WsMessage::Ping(payload)) => {
                    let _ = pong_tx.send(WsMessage::Pong(payload));
                }
                Ok(WsMessage::Close(frame)) => {
                    debug!(?frame, "upstream closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "upstream read error");
                    reader_addr.do_send(UpstreamGone { failed: true });
                    return;
                }
            }
        }
        reader_addr.do_send(UpstreamGone { failed: false });
    });

    addr.do_send(UpstreamReady {
        to_upstream: tx,
        reader,
        writer,
    });
}

impl Actor for RelaySession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.connection_opened();
        info!(
            session_id = ?self.session_id,
            active = self.state.get_metrics_snapshot().active_connections,
            "client connected"
        );

        self.start_heartbeat(ctx);

        match build_upstream_url(&self.upstream_url, self.session_id.as_deref()) {
            Ok(url) => {
                // Tied to the actor: if the client disappears mid-dial the
                // connect future is dropped with it.
                ctx.spawn(wrap_future::<_, Self>(connect_upstream(url, ctx.address())));
            }
            Err(e) => {
                error!(error = %e, "invalid upstream URL");
                ctx.address().do_send(UpstreamGone { failed: true });
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(pairing) = self.pairing.take() {
            pairing.shutdown();
        }
        self.state.connection_closed();
        info!(
            session_id = ?self.session_id,
            active = self.state.get_metrics_snapshot().active_connections,
            "client disconnected"
        );
    }
}

/// Inbound frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward_inbound(WsMessage::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward_inbound(WsMessage::Binary(data.to_vec()));
            }
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(?reason, "client closed connection");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<UpstreamReady> for RelaySession {
    type Result = ();

    fn handle(&mut self, msg: UpstreamReady, ctx: &mut Self::Context) {
        info!(session_id = ?self.session_id, "pairing active");
        self.pairing = Some(Pairing {
            to_upstream: msg.to_upstream,
            reader: msg.reader,
            _writer: msg.writer,
        });
        self.state.pairing_opened();
        ctx.text(ControlMessage::system("AI service connected").to_json());
    }
}

impl Handler<UpstreamFrame> for RelaySession {
    type Result = ();

    fn handle(&mut self, msg: UpstreamFrame, ctx: &mut Self::Context) {
        match msg.0 {
            WsMessage::Text(text) => ctx.text(text),
            WsMessage::Binary(data) => ctx.binary(data),
            _ => {}
        }
    }
}

impl Handler<UpstreamGone> for RelaySession {
    type Result = ();

    fn handle(&mut self, msg: UpstreamGone, ctx: &mut Self::Context) {
        if let Some(pairing) = self.pairing.take() {
            pairing.shutdown();
        }

        if msg.failed {
            self.state.upstream_failure();
            if !self.upstream_notice_sent {
                self.upstream_notice_sent = true;
                ctx.text(ControlMessage::error("AI service unavailable").to_json());
            }
        } else {
            info!(session_id = ?self.session_id, "upstream closed, pairing dropped");
        }
        // The inbound side stays open: re-establishing a session is the
        // client's decision, made by dialing in again.
    }
}

/// WebSocket endpoint handler: checks the origin policy, extracts the
/// session token, and hands the connection to a [`RelaySession`] actor.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = state.get_config();

    let origin = req
        .headers()
        .get(actix_web::http::header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !config.cors.permits(origin) {
        warn!(?origin, "rejected connection from disallowed origin");
        return Ok(HttpResponse::Forbidden().finish());
    }

    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(HashMap::new()));
    let session_id = query.get("session_id").cloned();

    info!(
        session_id = ?session_id,
        peer = ?req.connection_info().peer_addr(),
        "new relay connection request"
    );

    let session = RelaySession::new(session_id, config.upstream.url.clone(), state.get_ref().clone());
    ws::start(session, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_url_carries_session_token() {
        let url = build_upstream_url("ws://localhost:8000/ws/ai", Some("abc-123")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/ai?session_id=abc-123");
    }

    #[test]
    fn test_upstream_url_without_token() {
        let url = build_upstream_url("ws://localhost:8000/ws/ai", None).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8000/ws/ai");
    }

    #[test]
    fn test_upstream_url_rejects_garbage() {
        assert!(build_upstream_url("not a url", None).is_err());
    }

    #[tokio::test]
    async fn test_pairing_preserves_order_and_content() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pairing = Pairing {
            to_upstream: tx,
            reader: tokio::spawn(async {}),
            _writer: tokio::spawn(async {}),
        };

        let frames = vec![
            WsMessage::Binary(vec![1, 2, 3]),
            WsMessage::Text("{\"type\":\"stop_recording\"}".to_string()),
            WsMessage::Binary(vec![4, 5]),
        ];
        for frame in &frames {
            assert!(pairing.forward(frame.clone()));
        }

        for expected in frames {
            let got = rx.recv().await.unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn test_forward_fails_after_writer_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let pairing = Pairing {
            to_upstream: tx,
            reader: tokio::spawn(async {}),
            _writer: tokio::spawn(async {}),
        };

        drop(rx);
        assert!(!pairing.forward(WsMessage::Binary(vec![0])));
    }

    #[test]
    fn test_synthesized_notices_use_the_control_envelope() {
        let connected = ControlMessage::system("AI service connected").to_json();
        assert!(connected.contains(r#""type":"system""#));

        let unavailable = ControlMessage::error("AI service unavailable").to_json();
        assert!(unavailable.contains(r#""type":"error""#));
        assert!(unavailable.contains("AI service unavailable"));
    }
}
