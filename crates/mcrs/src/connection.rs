use crate::admission::{Credentials, HandshakeError};
use crate::error::RelayError;
use crate::monitor::{counters, gauges};
use crate::registry::{CloseReason, PeerHandle, PeerIdentity, Removal};
use crate::server::ServerState;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mcr_common::codec::MessageCodec;
use mcr_common::types::error_code;
use mcr_common::{Message, ServerId};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::handshake::server::ErrorResponse;
use tokio_tungstenite::tungstenite::http::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Per-connection outbound queue depth.
const OUTBOUND_QUEUE: usize = 256;

/// How the authenticated phase of a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The peer closed, or the transport failed.
    Closed,
    /// The relay closed the transport on request from the registry side.
    Evicted(CloseReason),
    /// Every registry handle to this connection is gone.
    Detached,
    /// The relay is shutting down.
    Shutdown,
}

/// Decrements the open-connection count on every exit path.
struct ActiveGuard {
    state: Arc<ServerState>,
}

impl ActiveGuard {
    fn new(state: Arc<ServerState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        Self { state }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Owns a peer's registry entry for the lifetime of its connection task.
///
/// Dropping it removes the entry, whether the task ended normally, with an
/// error, or was aborted. The departure is announced only when this
/// connection still owned the entry and its join went out; an entry that was
/// superseded or evicted leaves silently.
struct Registration {
    state: Arc<ServerState>,
    server_id: ServerId,
    conn_id: u64,
    announced: bool,
}

impl Drop for Registration {
    fn drop(&mut self) {
        gauges::dec_connections_active();
        let removal = self
            .state
            .registry
            .remove_if_current(&self.server_id, self.conn_id);

        match removal {
            Removal::Removed if self.announced => {
                let notified = self.state.router.announce_leave(&self.server_id);
                info!(server_id = %self.server_id, conn_id = self.conn_id, notified, "peer left");
            }
            Removal::Removed => {
                debug!(server_id = %self.server_id, conn_id = self.conn_id, "peer left before join was announced");
            }
            Removal::Superseded => {
                debug!(server_id = %self.server_id, conn_id = self.conn_id, "superseded connection closed");
            }
            Removal::Absent => {
                debug!(server_id = %self.server_id, conn_id = self.conn_id, "evicted connection closed");
            }
        }
    }
}

fn close_frame(code: CloseCode, reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

fn close_for(reason: CloseReason) -> WsMessage {
    close_frame(CloseCode::from(reason.code()), reason.reason())
}

fn handshake_reason(err: &HandshakeError) -> &'static str {
    match err {
        HandshakeError::MissingCredential => "missing authorization token",
        HandshakeError::WeakCredential => "invalid authorization token",
        HandshakeError::MissingServerId => "missing server id",
    }
}

async fn send_message(ws_tx: &mut WsSink, message: &Message) -> Result<(), RelayError> {
    ws_tx
        .send(WsMessage::Text(MessageCodec::encode(message)))
        .await
        .map_err(RelayError::WebSocket)
}

/// Handles one inbound payload and writes any reply for the sender.
async fn process_text(
    text: &str,
    state: &ServerState,
    ws_tx: &mut WsSink,
    peer: &Peer<'_>,
) -> Result<(), RelayError> {
    if let Some(reply) = state.router.handle_frame(peer.server_id, peer.conn_id, text) {
        send_message(ws_tx, &reply).await?;
    }
    Ok(())
}

/// The admitted identity a message loop runs for.
struct Peer<'a> {
    server_id: &'a str,
    conn_id: u64,
}

/// Drive the main message-relay select loop for an admitted connection.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    outbound_rx: &mut mpsc::Receiver<Arc<str>>,
    close_rx: &mut watch::Receiver<Option<CloseReason>>,
    shutdown: &mut watch::Receiver<()>,
    state: &ServerState,
    peer: &Peer<'_>,
) -> Result<Exit, RelayError> {
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;

            changed = close_rx.changed() => {
                let requested = match changed {
                    Ok(()) => *close_rx.borrow_and_update(),
                    Err(_) => None,
                };
                return Ok(match requested {
                    Some(reason) => {
                        if let Err(e) = ws_tx.send(close_for(reason)).await {
                            debug!("failed to send close: {}", e);
                        }
                        Exit::Evicted(reason)
                    }
                    None => detach(ws_tx).await,
                });
            }
            _ = shutdown.changed() => {
                let _ = ws_tx.send(close_frame(CloseCode::Away, "relay shutting down")).await;
                return Ok(Exit::Shutdown);
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(text) => ws_tx.send(WsMessage::Text(text.to_string())).await?,
                    None => return Ok(detach(ws_tx).await),
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        process_text(&text, state, ws_tx, peer).await?;
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            process_text(text, state, ws_tx, peer).await?;
                        } else {
                            counters::validation_failures_total(error_code::INVALID_PAYLOAD);
                            let reply = state.router.error_reply(
                                peer.server_id,
                                error_code::INVALID_PAYLOAD,
                                "binary frame is not UTF-8 JSON",
                            );
                            send_message(ws_tx, &reply).await?;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = ws_tx.send(WsMessage::Pong(data)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(Exit::Closed),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    _ => {}
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = ws_tx.send(WsMessage::Ping(Vec::new())).await {
                    debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}

/// Closes a transport whose registry entry disappeared without a close request.
async fn detach(ws_tx: &mut WsSink) -> Exit {
    if let Err(e) = ws_tx
        .send(close_frame(CloseCode::Away, "no longer registered"))
        .await
    {
        debug!("failed to send close: {}", e);
    }
    Exit::Detached
}

/// Runs a peer connection from WebSocket upgrade to close.
///
/// Connecting: the upgrade headers are checked by the authenticator; a
/// refusal closes with 1008 and leaves the registry untouched.
/// Authenticated: the peer is registered, welcomed and announced, then its
/// frames are dispatched until the transport closes.
/// Closed: the registration guard removes the entry and, if this connection
/// still owned it, announces the leave.
///
/// # Errors
///
/// Returns an error if the upgrade, admission or transport fails.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), RelayError> {
    let _active = ActiveGuard::new(Arc::clone(&state));

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(state.config.max_message_size);
    ws_config.max_frame_size = Some(state.config.max_message_size);

    let credentials = Arc::new(OnceLock::new());
    let cell = Arc::clone(&credentials);
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request<()>, resp: Response<()>| -> Result<Response<()>, ErrorResponse> {
            let _ = cell.set(Credentials::from_headers(req.headers()));
            Ok(resp)
        },
        Some(ws_config),
    )
    .await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let credentials = credentials.get().cloned().unwrap_or_default();
    let claims = match state.authenticator.verify(&credentials) {
        Ok(claims) => claims,
        Err(e) => {
            counters::admissions_total("rejected");
            debug!(%peer_addr, reason = %e, "admission rejected");
            let _ = ws_tx
                .send(close_frame(CloseCode::Policy, handshake_reason(&e)))
                .await;
            return Err(RelayError::Handshake(e));
        }
    };
    counters::admissions_total("admitted");

    let conn_id = state.next_conn_id();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Arc<str>>(OUTBOUND_QUEUE);
    let handle = PeerHandle::new(outbound_tx, conn_id);
    let mut close_rx = handle.close_signal();
    let identity = PeerIdentity::new(claims, Utc::now());
    let server_id = identity.server_id.clone();

    if let Some(previous) = state.registry.register(identity, handle) {
        info!(%server_id, old_conn_id = previous.conn_id, conn_id, "replacing existing connection");
        previous.close(CloseReason::Replaced);
    }
    gauges::inc_connections_active();

    let mut registration = Registration {
        state: Arc::clone(&state),
        server_id: server_id.clone(),
        conn_id,
        announced: false,
    };
    info!(%server_id, conn_id, %peer_addr, "peer admitted");

    send_message(&mut ws_tx, &state.router.welcome(&server_id)).await?;
    state.router.announce_join(&server_id);
    registration.announced = true;

    let peer = Peer {
        server_id: &server_id,
        conn_id,
    };
    let exit = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut outbound_rx,
        &mut close_rx,
        &mut shutdown,
        &state,
        &peer,
    )
    .await?;
    debug!(%server_id, conn_id, ?exit, "connection loop ended");
    drop(registration);

    Ok(())
}
