use crate::monitor::{counters, histograms};
use crate::registry::{ConnectionRegistry, SendFailure};
use chrono::Utc;
use mcr_common::codec::{format_timestamp, MessageCodec};
use mcr_common::message::{Message, MessageType};
use mcr_common::types::{routing_code, BROADCAST, RELAY_ID};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

fn object(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

const fn failure_label(failure: SendFailure) -> &'static str {
    match failure {
        SendFailure::Closed => "closed",
        SendFailure::Full => "full",
    }
}

/// Dispatches validated messages between registered peers.
///
/// Replies meant for the sender are returned to the caller, which writes them
/// on the sender's own transport. Everything addressed to other peers is
/// queued through their registry handles.
#[derive(Debug)]
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    codec: MessageCodec,
}

impl Router {
    /// Create a router over `registry`, signing with `codec`.
    #[must_use]
    pub const fn new(registry: Arc<ConnectionRegistry>, codec: MessageCodec) -> Self {
        Self { registry, codec }
    }

    /// The registry this router reads and mutates.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The codec used for every relay-originated message.
    #[must_use]
    pub const fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    /// Processes one inbound text frame from `sender` on connection `conn_id`.
    ///
    /// Returns the message to write back to the sender, if any. Invalid frames
    /// produce a signed `error` reply and nothing else. Frames from a
    /// connection that no longer owns `sender`'s registry entry are dropped.
    pub fn handle_frame(&self, sender: &str, conn_id: u64, frame: &str) -> Option<Message> {
        let start = Instant::now();

        let message = match self.codec.decode_validated(frame.as_bytes()) {
            Ok(message) => message,
            Err(e) => {
                counters::validation_failures_total(e.code());
                debug!(server_id = sender, code = e.code(), "rejected inbound frame: {}", e);
                return Some(self.error_reply(sender, e.code(), &e.to_string()));
            }
        };

        if !self.registry.touch_if_current(sender, conn_id) {
            debug!(server_id = sender, conn_id, "dropping frame from unregistered connection");
            return None;
        }
        counters::messages_total(message.kind.as_str());

        let reply = self.dispatch(sender, &message, frame);
        histograms::dispatch_seconds(start.elapsed().as_secs_f64());
        reply
    }

    fn dispatch(&self, sender: &str, message: &Message, raw: &str) -> Option<Message> {
        match message.kind {
            MessageType::Heartbeat => Some(self.heartbeat_ack(sender)),
            MessageType::ServerRegister => {
                if self.registry.merge(sender, &message.payload) {
                    debug!(server_id = sender, "merged registration update");
                }
                None
            }
            MessageType::TeleportRequest => self.route_teleport(sender, message, raw),
            // No record of who asked, so every other peer hears the answer.
            MessageType::TeleportResponse => {
                self.broadcast_except(sender, Arc::from(raw));
                None
            }
            MessageType::StatusUpdate => {
                if message.to == BROADCAST {
                    self.broadcast_except(sender, Arc::from(raw));
                }
                None
            }
            _ => {
                debug!(server_id = sender, kind = %message.kind, "ignoring message");
                None
            }
        }
    }

    fn heartbeat_ack(&self, sender: &str) -> Message {
        self.codec.create_message(
            MessageType::HeartbeatAck,
            RELAY_ID,
            sender,
            object(json!({
                "serverTime": format_timestamp(Utc::now()),
                "connectedServers": self.registry.size(),
            })),
        )
    }

    /// Forwards the request verbatim, or answers the requester with a failure.
    fn route_teleport(&self, sender: &str, request: &Message, raw: &str) -> Option<Message> {
        let Some(target) = self.registry.handle(&request.to) else {
            counters::routing_failures_total(routing_code::SERVER_NOT_FOUND);
            debug!(server_id = sender, target = %request.to, "teleport target not found");
            return Some(self.teleport_failure(
                sender,
                request,
                routing_code::SERVER_NOT_FOUND,
                "target server is not connected",
            ));
        };

        match target.send(Arc::from(raw)) {
            Ok(()) => None,
            Err(failure) => {
                counters::send_failures_total(failure_label(failure));
                counters::routing_failures_total(routing_code::TARGET_UNAVAILABLE);
                warn!(
                    server_id = sender,
                    target = %request.to,
                    ?failure,
                    "teleport target unavailable"
                );
                Some(self.teleport_failure(
                    sender,
                    request,
                    routing_code::TARGET_UNAVAILABLE,
                    "target server could not receive the request",
                ))
            }
        }
    }

    fn teleport_failure(
        &self,
        sender: &str,
        request: &Message,
        code: &str,
        reason: &str,
    ) -> Message {
        self.codec.create_message(
            MessageType::TeleportResponse,
            RELAY_ID,
            sender,
            object(json!({
                "status": "failed",
                "code": code,
                "message": reason,
                "requestId": request.id,
            })),
        )
    }

    /// Signed `error` message for `to`.
    #[must_use]
    pub fn error_reply(&self, to: &str, code: &str, reason: &str) -> Message {
        self.codec.create_message(
            MessageType::Error,
            RELAY_ID,
            to,
            object(json!({ "code": code, "message": reason })),
        )
    }

    /// Registry snapshot for a newly admitted peer, excluding itself.
    #[must_use]
    pub fn welcome(&self, server_id: &str) -> Message {
        let servers: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|v| v.server_id != server_id)
            .collect();
        self.codec.create_message(
            MessageType::Welcome,
            RELAY_ID,
            server_id,
            object(json!({
                "serverId": server_id,
                "serverTime": format_timestamp(Utc::now()),
                "servers": servers,
            })),
        )
    }

    /// Tells every other peer that `server_id` joined.
    pub fn announce_join(&self, server_id: &str) -> usize {
        let Some(identity) = self.registry.get(server_id) else {
            return 0;
        };
        let update = self.codec.create_message(
            MessageType::ServerUpdate,
            RELAY_ID,
            BROADCAST,
            object(json!({ "action": "join", "server": identity.view() })),
        );
        self.broadcast_message(server_id, &update)
    }

    /// Tells every remaining peer that `server_id` left.
    pub fn announce_leave(&self, server_id: &str) -> usize {
        let update = self.codec.create_message(
            MessageType::ServerUpdate,
            RELAY_ID,
            BROADCAST,
            object(json!({ "action": "leave", "serverId": server_id })),
        );
        self.broadcast_message(server_id, &update)
    }

    fn broadcast_message(&self, exclude: &str, message: &Message) -> usize {
        self.broadcast_except(exclude, Arc::from(MessageCodec::encode(message)))
    }

    /// Queues `text` for every peer except `exclude`. Returns how many accepted it.
    pub fn broadcast_except(&self, exclude: &str, text: Arc<str>) -> usize {
        let mut delivered = 0;
        for (server_id, handle) in self.registry.handles_except(exclude) {
            match handle.send(Arc::clone(&text)) {
                Ok(()) => delivered += 1,
                Err(failure) => {
                    counters::send_failures_total(failure_label(failure));
                    debug!(%server_id, ?failure, "broadcast not delivered");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::PeerClaims;
    use crate::registry::{PeerHandle, PeerIdentity};
    use mcr_common::SharedSecret;
    use tokio::sync::mpsc;

    const SECRET: &str = "router-test-secret";

    fn router() -> Router {
        Router::new(
            Arc::new(ConnectionRegistry::new()),
            MessageCodec::new(SharedSecret::new(SECRET)),
        )
    }

    fn connect(router: &Router, id: &str, conn_id: u64) -> mpsc::Receiver<Arc<str>> {
        let (tx, rx) = mpsc::channel(16);
        let claims = PeerClaims {
            server_id: id.to_owned(),
            version: Some("1.20.4".into()),
            capabilities: vec!["teleport".into()],
        };
        let _ = router
            .registry()
            .register(PeerIdentity::new(claims, Utc::now()), PeerHandle::new(tx, conn_id));
        rx
    }

    fn inbound(kind: &str, from: &str, to: &str, payload: Value) -> String {
        json!({
            "type": kind,
            "id": "req-1",
            "timestamp": format_timestamp(Utc::now()),
            "from": from,
            "to": to,
            "payload": payload,
        })
        .to_string()
    }

    fn next_text(rx: &mut mpsc::Receiver<Arc<str>>) -> Option<String> {
        rx.try_recv().ok().map(|text| text.to_string())
    }

    fn next_message(rx: &mut mpsc::Receiver<Arc<str>>) -> Option<Message> {
        next_text(rx).map(|t| serde_json::from_str(&t).unwrap())
    }

    #[test]
    fn invalid_json_yields_signed_error_only() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let mut b = connect(&router, "b", 2);

        let reply = router.handle_frame("a", 1, "{not json").unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.to, "a");
        assert_eq!(reply.payload_str("code"), Some("INVALID_PAYLOAD"));
        assert!(router.codec().validate(reply).is_ok());
        assert!(next_text(&mut b).is_none());
    }

    #[test]
    fn missing_fields_yield_error() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let reply = router
            .handle_frame("a", 1, r#"{"type":"heartbeat","from":"a"}"#)
            .unwrap();
        assert_eq!(reply.payload_str("code"), Some("MISSING_FIELDS"));
    }

    #[test]
    fn stale_message_yields_error_and_no_touch() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let before = router.registry().get("a").unwrap().last_seen;
        let frame = json!({
            "type": "heartbeat",
            "id": "x",
            "timestamp": format_timestamp(Utc::now() - chrono::Duration::seconds(301)),
            "from": "a",
            "to": "relay",
        })
        .to_string();

        let reply = router.handle_frame("a", 1, &frame).unwrap();
        assert_eq!(reply.payload_str("code"), Some("STALE_TIMESTAMP"));
        assert_eq!(router.registry().get("a").unwrap().last_seen, before);
    }

    #[test]
    fn bad_signature_yields_error() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let mut frame: Value = serde_json::from_str(&inbound("heartbeat", "a", "relay", json!({})))
            .unwrap();
        frame["signature"] = json!("AAAA");
        let reply = router.handle_frame("a", 1, &frame.to_string()).unwrap();
        assert_eq!(reply.payload_str("code"), Some("INVALID_SIGNATURE"));
    }

    #[test]
    fn correctly_signed_inbound_is_accepted() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let peer_codec = MessageCodec::new(SharedSecret::new(SECRET));
        let msg = peer_codec.create_message(MessageType::Heartbeat, "a", RELAY_ID, None);
        let reply = router
            .handle_frame("a", 1, &MessageCodec::encode(&msg))
            .unwrap();
        assert_eq!(reply.kind, MessageType::HeartbeatAck);
    }

    #[test]
    fn heartbeat_acks_with_registry_size() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let _b = connect(&router, "b", 2);
        let past = Utc::now() - chrono::Duration::seconds(120);
        router.registry().touch_last_seen_at("a", past);

        let reply = router
            .handle_frame("a", 1, &inbound("heartbeat", "a", "relay", json!({})))
            .unwrap();
        assert_eq!(reply.kind, MessageType::HeartbeatAck);
        assert_eq!(reply.from, RELAY_ID);
        assert_eq!(reply.payload["connectedServers"], 2);
        assert!(reply.payload_str("serverTime").is_some());
        assert!(router.registry().get("a").unwrap().last_seen > past);
    }

    #[test]
    fn server_register_merges_payload() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let reply = router.handle_frame(
            "a",
            1,
            &inbound(
                "server_register",
                "a",
                "relay",
                json!({"motd": "A Minecraft Server", "players": 3}),
            ),
        );
        assert!(reply.is_none());
        let identity = router.registry().get("a").unwrap();
        assert_eq!(identity.extra["motd"], "A Minecraft Server");
        assert_eq!(identity.version.as_deref(), Some("1.20.4"));
    }

    #[test]
    fn teleport_to_unknown_server_fails_once() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let mut c = connect(&router, "c", 3);

        let reply = router
            .handle_frame(
                "a",
                1,
                &inbound("teleport_request", "a", "ghost", json!({"player": "Steve"})),
            )
            .unwrap();
        assert_eq!(reply.kind, MessageType::TeleportResponse);
        assert_eq!(reply.to, "a");
        assert_eq!(reply.payload_str("status"), Some("failed"));
        assert_eq!(reply.payload_str("code"), Some("SERVER_NOT_FOUND"));
        assert_eq!(reply.payload_str("requestId"), Some("req-1"));
        assert!(next_text(&mut c).is_none());
    }

    #[test]
    fn teleport_is_forwarded_verbatim() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let mut b = connect(&router, "b", 2);
        let mut c = connect(&router, "c", 3);

        let frame = inbound("teleport_request", "a", "b", json!({"player": "Alex"}));
        assert!(router.handle_frame("a", 1, &frame).is_none());
        assert_eq!(next_text(&mut b).as_deref(), Some(frame.as_str()));
        assert!(next_text(&mut c).is_none());
    }

    #[test]
    fn teleport_to_closed_transport_is_unavailable() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let b = connect(&router, "b", 2);
        drop(b);

        let reply = router
            .handle_frame("a", 1, &inbound("teleport_request", "a", "b", json!({})))
            .unwrap();
        assert_eq!(reply.payload_str("code"), Some("TARGET_UNAVAILABLE"));
        assert_eq!(reply.to, "a");
    }

    #[test]
    fn teleport_response_reaches_everyone_but_sender() {
        let router = router();
        let mut a = connect(&router, "a", 1);
        let mut b = connect(&router, "b", 2);
        let mut c = connect(&router, "c", 3);

        let frame = inbound(
            "teleport_response",
            "b",
            "a",
            json!({"request_id": "req-1", "status": "accepted"}),
        );
        assert!(router.handle_frame("b", 2, &frame).is_none());
        assert_eq!(next_text(&mut a).as_deref(), Some(frame.as_str()));
        assert_eq!(next_text(&mut c).as_deref(), Some(frame.as_str()));
        assert!(next_text(&mut b).is_none());
    }

    #[test]
    fn status_update_broadcast_and_directed() {
        let router = router();
        let mut a = connect(&router, "a", 1);
        let mut b = connect(&router, "b", 2);

        let broadcast = inbound("status_update", "a", "broadcast", json!({"tps": 19.8}));
        assert!(router.handle_frame("a", 1, &broadcast).is_none());
        assert_eq!(next_text(&mut b).as_deref(), Some(broadcast.as_str()));
        assert!(next_text(&mut a).is_none());

        let directed = inbound("status_update", "a", "b", json!({"tps": 20.0}));
        assert!(router.handle_frame("a", 1, &directed).is_none());
        assert!(next_text(&mut b).is_none());
    }

    #[test]
    fn unknown_type_is_ignored() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let mut b = connect(&router, "b", 2);
        assert!(router
            .handle_frame("a", 1, &inbound("chat_sync", "a", "broadcast", json!({})))
            .is_none());
        assert!(next_text(&mut b).is_none());
    }

    #[test]
    fn welcome_excludes_new_peer() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let _b = connect(&router, "b", 2);

        let welcome = router.welcome("b");
        assert_eq!(welcome.kind, MessageType::Welcome);
        assert_eq!(welcome.to, "b");
        let servers = welcome.payload["servers"].as_array().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0]["serverId"], "a");
    }

    #[test]
    fn join_and_leave_are_signed_broadcasts() {
        let router = router();
        let mut a = connect(&router, "a", 1);
        let mut b = connect(&router, "b", 2);

        assert_eq!(router.announce_join("b"), 1);
        let join = next_message(&mut a).unwrap();
        assert_eq!(join.kind, MessageType::ServerUpdate);
        assert_eq!(join.payload_str("action"), Some("join"));
        assert_eq!(join.payload["server"]["serverId"], "b");
        assert!(router.codec().validate(join).is_ok());
        assert!(next_text(&mut b).is_none());

        router.registry().remove("b");
        assert_eq!(router.announce_leave("b"), 1);
        let leave = next_message(&mut a).unwrap();
        assert_eq!(leave.payload_str("action"), Some("leave"));
        assert_eq!(leave.payload_str("serverId"), Some("b"));
    }

    #[test]
    fn announce_join_for_unregistered_is_noop() {
        let router = router();
        let mut a = connect(&router, "a", 1);
        assert_eq!(router.announce_join("ghost"), 0);
        assert!(next_text(&mut a).is_none());
    }

    #[test]
    fn superseded_connection_frames_are_dropped() {
        let router = router();
        let _old = connect(&router, "a", 1);
        let _new = connect(&router, "a", 7);
        let mut b = connect(&router, "b", 2);
        let past = Utc::now() - chrono::Duration::seconds(120);
        router.registry().touch_last_seen_at("a", past);

        assert!(router
            .handle_frame("a", 1, &inbound("heartbeat", "a", "relay", json!({})))
            .is_none());
        assert!(router
            .handle_frame("a", 1, &inbound("teleport_request", "a", "b", json!({})))
            .is_none());
        assert!(router
            .handle_frame("a", 1, &inbound("status_update", "a", "broadcast", json!({})))
            .is_none());
        assert!(next_text(&mut b).is_none());
        assert_eq!(router.registry().get("a").unwrap().last_seen, past);

        // The current owner is still served.
        let reply = router
            .handle_frame("a", 7, &inbound("heartbeat", "a", "relay", json!({})))
            .unwrap();
        assert_eq!(reply.kind, MessageType::HeartbeatAck);
    }

    #[test]
    fn evicted_connection_frames_are_dropped() {
        let router = router();
        let _a = connect(&router, "a", 1);
        let mut b = connect(&router, "b", 2);
        router.registry().remove("a");

        assert!(router
            .handle_frame("a", 1, &inbound("status_update", "a", "broadcast", json!({})))
            .is_none());
        assert!(next_text(&mut b).is_none());
        assert!(router.registry().get("a").is_none());
    }
}
