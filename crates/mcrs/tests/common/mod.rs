#![allow(dead_code)]

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use mcr_common::codec::{format_timestamp, MessageCodec};
use mcr_common::{Message, MessageType, SharedSecret};
use mcrs::config::ServerConfig;
use mcrs::server::ServerState;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const SECRET: &str = "integration-shared-secret";
pub const TOKEN: &str = "peer-token-0123456789";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        monitor_addr: "127.0.0.1:0".parse().unwrap(),
        shared_secret: SharedSecret::new(SECRET),
        max_conns: 1000,
        max_message_size: 1_048_576,
        ping_interval: 30,
        reap_interval: 60,
        stale_after: 300,
    }
}

pub fn codec() -> MessageCodec {
    MessageCodec::new(SharedSecret::new(SECRET))
}

/// A running relay. Dropping it stops the accept loop and the reaper.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    shutdown_tx: watch::Sender<()>,
}

impl TestServer {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

pub async fn start_server_with(config: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut cfg = test_config(addr);
    config(&mut cfg);
    let state = Arc::new(ServerState::new(cfg));
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = mcrs::run_with_shutdown(listener, state_clone, shutdown_rx).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        state,
        shutdown_tx,
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

/// Opens a WebSocket with arbitrary admission headers.
pub async fn connect_raw(addr: &SocketAddr, headers: &[(&'static str, &str)]) -> Ws {
    let url = format!("ws://{addr}");
    let mut req = url.into_client_request().unwrap();
    for (name, value) in headers {
        req.headers_mut().insert(*name, value.parse().unwrap());
    }
    let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
    ws
}

/// Reads until a close frame arrives and returns it.
pub async fn expect_close<S>(ws: &mut S) -> Option<CloseFrame<'static>>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");
        match msg {
            Some(Ok(WsMessage::Close(frame))) => return frame,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

pub struct TestClient {
    pub ws_tx: SplitSink<Ws, WsMessage>,
    pub ws_rx: SplitStream<Ws>,
    pub server_id: String,
    /// The welcome message received on admission.
    pub welcome: Message,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr, server_id: &str) -> Self {
        Self::connect_with(addr, server_id, &[]).await
    }

    pub async fn connect_with(
        addr: &SocketAddr,
        server_id: &str,
        extra: &[(&'static str, &str)],
    ) -> Self {
        let bearer = format!("Bearer {TOKEN}");
        let mut headers = vec![
            ("authorization", bearer.as_str()),
            ("x-server-id", server_id),
        ];
        headers.extend_from_slice(extra);
        let ws = connect_raw(addr, &headers).await;
        let (ws_tx, ws_rx) = ws.split();

        let mut client = Self {
            ws_tx,
            ws_rx,
            server_id: server_id.to_owned(),
            welcome: placeholder(),
        };
        let welcome = client.recv_message().await;
        assert_eq!(welcome.kind, MessageType::Welcome, "expected welcome, got {welcome:?}");
        client.welcome = welcome;
        client
    }

    pub async fn send_text(&mut self, text: String) {
        self.ws_tx.send(WsMessage::Text(text)).await.unwrap();
    }

    /// Sends an unsigned message and returns its wire text.
    pub async fn send(&mut self, kind: &str, to: &str, payload: Value) -> String {
        let text = json!({
            "type": kind,
            "id": format!("{}-{}", self.server_id, uuid_like()),
            "timestamp": format_timestamp(Utc::now()),
            "from": self.server_id,
            "to": to,
            "payload": payload,
        })
        .to_string();
        self.send_text(text.clone()).await;
        text
    }

    /// Next text frame, skipping control frames.
    pub async fn recv_text(&mut self) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for message")
                .unwrap()
                .unwrap();
            match msg {
                WsMessage::Text(text) => return text,
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_message(&mut self) -> Message {
        let text = self.recv_text().await;
        serde_json::from_str(&text).unwrap()
    }

    /// Next message of `kind`, skipping others (e.g. join notices).
    pub async fn recv_kind(&mut self, kind: MessageType) -> Message {
        loop {
            let msg = self.recv_message().await;
            if msg.kind == kind {
                return msg;
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.recv_text()).await.ok()
    }

    /// Asserts nothing but control frames arrive within `timeout`.
    pub async fn expect_silence(&mut self, timeout: Duration) {
        if let Some(text) = self.recv_timeout(timeout).await {
            panic!("{} expected no message, got {text}", self.server_id);
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(WsMessage::Close(None)).await;
        // Let the relay observe the close before the test continues.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn placeholder() -> Message {
    Message {
        kind: MessageType::Other(String::new()),
        id: String::new(),
        timestamp: String::new(),
        from: String::new(),
        to: String::new(),
        payload: serde_json::Map::new(),
        signature: None,
    }
}

fn uuid_like() -> u128 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    u128::from(NEXT.fetch_add(1, Ordering::Relaxed))
}
