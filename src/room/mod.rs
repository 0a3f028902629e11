//! Per-device rooms: the in-memory multiplex between one host and up to N
//! mobile attachments.
//!
//! A room is a single-consumer actor keyed by device identifier. Its
//! in-memory state is strictly a cache: the ground truth is the set of live
//! sockets and the attachment JSON persisted on each of them, so a room that
//! lost its memory (the runtime may suspend it between messages) rebuilds
//! routing tables by scanning the transport's socket list. Admission counts
//! and status snapshots therefore always enumerate live sockets, never the
//! cache.

pub mod message;
pub mod socket;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::RelayConfig;
use message::{Envelope, MessageType, ParseError};
use socket::{
    Attachment, AttachedSocket, Role, SocketRegistry, CLOSE_NORMAL, CLOSE_TRY_AGAIN_LATER,
    OUTBOUND_BUFFER,
};

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Process-wide map of device id → room. Rooms are created on first use and
/// stay addressable after their host disconnects.
pub struct RoomRegistry {
    max_mobiles: usize,
    rooms: Mutex<HashMap<String, Arc<DeviceRoom>>>,
}

impl RoomRegistry {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            max_mobiles: config.max_connections_per_device,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, device_id: &str) -> Arc<DeviceRoom> {
        lock(&self.rooms)
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(DeviceRoom::new(device_id, self.max_mobiles)))
            .clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceRoom>> {
        lock(&self.rooms).get(device_id).cloned()
    }
}

// ─── Room ─────────────────────────────────────────────────────────────────────

/// In-memory cache of attachment metadata and host-reported device info.
/// Lost on suspension; rebuilt lazily from socket attachments.
#[derive(Default)]
struct RoomCache {
    attachments: HashMap<String, Attachment>,
    device_name: Option<String>,
    public_key: Option<String>,
}

pub struct DeviceRoom {
    device_id: String,
    max_mobiles: usize,
    sockets: SocketRegistry,
    cache: Mutex<RoomCache>,
}

impl DeviceRoom {
    fn new(device_id: &str, max_mobiles: usize) -> Self {
        Self {
            device_id: device_id.to_string(),
            max_mobiles,
            sockets: SocketRegistry::default(),
            cache: Mutex::new(RoomCache::default()),
        }
    }

    /// Count of live mobile sockets, from the transport's socket list.
    pub fn live_mobile_count(&self) -> usize {
        self.sockets
            .snapshot()
            .iter()
            .filter_map(|s| s.attachment())
            .filter(|a| a.role == Role::Mobile)
            .count()
    }

    /// Drop all cached state, as a runtime suspension would. The next
    /// message forces recovery from socket attachments.
    pub fn drop_cached_state(&self) {
        *lock(&self.cache) = RoomCache::default();
    }

    // ── Admission ────────────────────────────────────────────────────────────

    /// Attach a host socket, displacing any existing host with a single
    /// 1000-coded close.
    fn accept_host(&self, socket: Arc<AttachedSocket>) {
        if let Some(old) = self.find_host() {
            old.close(CLOSE_NORMAL, "Connection replaced");
            self.sockets.remove(&old.connection_id);
            lock(&self.cache).attachments.remove(&old.connection_id);
            debug!(device_id = %self.device_id, "existing host displaced");
        }

        let attachment = Attachment::host(&socket.connection_id);
        socket.store_attachment(&attachment);
        self.remember(attachment);
        self.sockets.insert(socket);
    }

    /// Attach a mobile socket. The gateway rejects over-cap upgrades with
    /// 429 before the handshake; this re-check closes the race where two
    /// upgrades pass that check concurrently.
    fn accept_mobile(&self, socket: Arc<AttachedSocket>, mobile_id: &str) -> bool {
        let attachment = Attachment::mobile(&socket.connection_id, mobile_id);
        socket.store_attachment(&attachment);

        let cap = self.max_mobiles;
        let admitted = self.sockets.insert_guarded(socket, |live| {
            live.iter()
                .filter_map(|s| s.attachment())
                .filter(|a| a.role == Role::Mobile)
                .count()
                < cap
        });
        if !admitted {
            return false;
        }

        self.remember(attachment);
        self.notify_host(Envelope::new(
            MessageType::MobileConnected,
            json!({ "mobile_id": mobile_id }),
        ));
        true
    }

    // ── Lookups (cache with live-socket fallback) ────────────────────────────

    /// Attachment for a connection: cache first, then the socket itself.
    fn attachment_of(&self, connection_id: &str) -> Option<Attachment> {
        let cached = lock(&self.cache).attachments.get(connection_id).cloned();
        if let Some(att) = cached {
            if self.sockets.get(connection_id).is_some() {
                return Some(att);
            }
        }
        let att = self.sockets.get(connection_id)?.attachment()?;
        self.remember(att.clone());
        Some(att)
    }

    fn find_host(&self) -> Option<Arc<AttachedSocket>> {
        let cached = lock(&self.cache)
            .attachments
            .values()
            .find(|a| a.role == Role::Host)
            .map(|a| a.connection_id.clone());
        if let Some(id) = cached {
            if let Some(sock) = self.sockets.get(&id) {
                return Some(sock);
            }
        }
        // Wake-up path: rebuild from live sockets.
        for sock in self.sockets.snapshot() {
            if let Some(att) = sock.attachment() {
                if att.role == Role::Host {
                    self.remember(att);
                    return Some(sock);
                }
            }
        }
        None
    }

    fn find_mobile(&self, mobile_id: &str) -> Option<Arc<AttachedSocket>> {
        let cached = lock(&self.cache)
            .attachments
            .values()
            .find(|a| a.role == Role::Mobile && a.mobile_id.as_deref() == Some(mobile_id))
            .map(|a| a.connection_id.clone());
        if let Some(id) = cached {
            if let Some(sock) = self.sockets.get(&id) {
                return Some(sock);
            }
        }
        for sock in self.sockets.snapshot() {
            if let Some(att) = sock.attachment() {
                if att.role == Role::Mobile && att.mobile_id.as_deref() == Some(mobile_id) {
                    self.remember(att);
                    return Some(sock);
                }
            }
        }
        None
    }

    fn remember(&self, attachment: Attachment) {
        lock(&self.cache)
            .attachments
            .insert(attachment.connection_id.clone(), attachment);
    }

    /// Bump `last_activity` in the cache and on the socket itself, so the
    /// ground truth stays current across suspensions.
    fn touch(&self, attachment: &mut Attachment) {
        attachment.last_activity = Utc::now().timestamp_millis();
        if let Some(sock) = self.sockets.get(&attachment.connection_id) {
            sock.store_attachment(attachment);
        }
        self.remember(attachment.clone());
    }

    // ── Message handling ─────────────────────────────────────────────────────

    /// Route one inbound text frame. Wrong-role and unknown-type messages
    /// are dropped; a missing forward target is a silent routing miss.
    pub fn on_message(&self, connection_id: &str, text: &str) {
        let Some(mut attachment) = self.attachment_of(connection_id) else {
            warn!(connection_id, "message from unregistered socket dropped");
            return;
        };
        self.touch(&mut attachment);

        let mut envelope = match Envelope::parse(text) {
            Ok(env) => env,
            Err(ParseError::UnknownType(t)) => {
                debug!(msg_type = %t, "unknown message type dropped");
                return;
            }
            Err(ParseError::Malformed(e)) => {
                warn!(err = %e, "malformed frame dropped");
                return;
            }
        };

        let mobile_id = attachment.mobile_id.clone().unwrap_or_default();

        match (attachment.role, envelope.msg_type) {
            (Role::Host, MessageType::Register) => self.handle_register(&attachment, &envelope),

            (_, MessageType::Ping) => self.reply(
                &attachment,
                Envelope::new(
                    MessageType::Pong,
                    json!({ "time": Utc::now().timestamp_millis() }),
                ),
            ),

            // Mobile → host requests gain the sender's identity.
            (
                Role::Mobile,
                MessageType::WorkspaceList | MessageType::SessionCreate | MessageType::SessionClose,
            ) => {
                envelope
                    .payload_object()
                    .insert("request_from".to_string(), json!(mobile_id));
                self.forward_to_host(envelope);
            }

            (Role::Mobile, MessageType::TerminalInput | MessageType::TerminalResize) => {
                envelope
                    .payload_object()
                    .insert("from".to_string(), json!(mobile_id));
                self.forward_to_host(envelope);
            }

            // Host → mobile replies are routed by the key the host set,
            // which the room strips before delivery.
            (Role::Host, MessageType::WorkspaceData | MessageType::SessionCreated) => {
                self.route_to_mobile(envelope, "request_to");
            }

            (Role::Host, MessageType::TerminalOutput) => {
                self.route_to_mobile(envelope, "to");
            }

            // Host-side session teardown (child exited) — tell the owner.
            (Role::Host, MessageType::SessionClose) => {
                self.route_to_mobile(envelope, "to");
            }

            (Role::Mobile, MessageType::MobileDisconnect) => {
                if let Some(sock) = self.sockets.get(connection_id) {
                    sock.close(CLOSE_NORMAL, "mobile disconnect");
                }
            }

            (role, msg_type) => {
                trace!(?role, ?msg_type, "message from wrong role dropped");
            }
        }
    }

    fn handle_register(&self, attachment: &Attachment, envelope: &Envelope) {
        {
            let mut cache = lock(&self.cache);
            if let Some(payload) = envelope.payload.as_ref() {
                if let Some(name) = payload.get("device_name").and_then(Value::as_str) {
                    cache.device_name = Some(name.to_string());
                }
                if let Some(key) = payload.get("public_key").and_then(Value::as_str) {
                    cache.public_key = Some(key.to_string());
                }
            }
        }
        debug!(device_id = %self.device_id, "host registered");
        self.reply(
            attachment,
            Envelope::new(MessageType::Registered, json!({ "success": true })),
        );
    }

    fn reply(&self, attachment: &Attachment, envelope: Envelope) {
        if let Some(sock) = self.sockets.get(&attachment.connection_id) {
            if !sock.send(&envelope) {
                warn!(connection_id = %attachment.connection_id, "reply dropped — socket buffer full");
            }
        }
    }

    fn forward_to_host(&self, envelope: Envelope) {
        let envelope = envelope.stamp();
        match self.find_host() {
            Some(host) => {
                if !host.send(&envelope) {
                    warn!(device_id = %self.device_id, "host buffer full — message dropped");
                }
            }
            // Expected during reconnect races; the sender is not notified.
            None => trace!(device_id = %self.device_id, "no host attached — message dropped"),
        }
    }

    fn route_to_mobile(&self, mut envelope: Envelope, routing_key: &str) {
        let target = envelope
            .payload_object()
            .remove(routing_key)
            .and_then(|v| v.as_str().map(str::to_string));
        let Some(mobile_id) = target else {
            debug!(routing_key, "host message missing routing key dropped");
            return;
        };

        let envelope = envelope.stamp();
        match self.find_mobile(&mobile_id) {
            Some(sock) => {
                if !sock.send(&envelope) {
                    // Never let a slow mobile back up the host path.
                    warn!(mobile_id = %mobile_id, "mobile buffer full — disconnecting slow mobile");
                    sock.close(CLOSE_TRY_AGAIN_LATER, "slow consumer");
                }
            }
            None => trace!(mobile_id = %mobile_id, "target mobile not attached — message dropped"),
        }
    }

    fn notify_host(&self, envelope: Envelope) {
        if let Some(host) = self.find_host() {
            if !host.send(&envelope) {
                warn!(device_id = %self.device_id, "host buffer full — notification dropped");
            }
        }
    }

    // ── Disconnects ──────────────────────────────────────────────────────────

    /// Transport-level socket error: log it; the connection task tears the
    /// socket down and `on_close` does the bookkeeping.
    pub fn on_error(&self, connection_id: &str, err: &axum::Error) {
        warn!(connection_id, err = %err, "socket error — disconnecting");
    }

    /// A socket is gone. Mobile-gone tells the host; host-gone fans an error
    /// and a clean close out to every mobile and clears the table.
    pub fn on_close(&self, connection_id: &str) {
        let attachment = self.attachment_of(connection_id);
        self.sockets.remove(connection_id);
        lock(&self.cache).attachments.remove(connection_id);

        let Some(attachment) = attachment else { return };
        match attachment.role {
            Role::Mobile => {
                if let Some(mobile_id) = attachment.mobile_id {
                    debug!(device_id = %self.device_id, mobile_id = %mobile_id, "mobile disconnected");
                    self.notify_host(Envelope::new(
                        MessageType::MobileDisconnect,
                        json!({ "mobile_id": mobile_id }),
                    ));
                }
            }
            Role::Host => {
                debug!(device_id = %self.device_id, "host disconnected — closing mobiles");
                for sock in self.sockets.snapshot() {
                    let is_mobile = sock
                        .attachment()
                        .map(|a| a.role == Role::Mobile)
                        .unwrap_or(false);
                    if is_mobile {
                        sock.send(&Envelope::new(
                            MessageType::Error,
                            json!({ "message": "Desktop disconnected" }),
                        ));
                        sock.close(CLOSE_NORMAL, "desktop disconnected");
                    }
                }
                lock(&self.cache).attachments.clear();
            }
        }
    }

    // ── Status ───────────────────────────────────────────────────────────────

    /// Room status built from the live socket list, never the cache.
    pub fn status_snapshot(&self) -> Value {
        let sockets = self.sockets.snapshot();
        let mut host_connected = false;
        let mut mobiles = Vec::new();
        for sock in &sockets {
            match sock.attachment() {
                Some(att) if att.role == Role::Host => host_connected = true,
                Some(att) => mobiles.push(json!({
                    "mobile_id": att.mobile_id,
                    "connected_at": att.connected_at,
                    "last_activity": att.last_activity,
                })),
                None => {}
            }
        }
        json!({
            "device_id": self.device_id,
            "device_name": lock(&self.cache).device_name,
            "host_connected": host_connected,
            "mobile_attachments": mobiles,
            "total_sockets": sockets.len(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Transport glue ───────────────────────────────────────────────────────────

/// Drive one upgraded WebSocket against its room until either side closes.
///
/// The gateway has already authenticated the connection and checked the
/// mobile cap; `mobile_id` comes from the verified token claims and only the
/// gateway may set it.
pub async fn run_socket(
    room: Arc<DeviceRoom>,
    ws: WebSocket,
    role: Role,
    mobile_id: Option<String>,
) {
    let (tx, mut rx) = mpsc::channel::<WsMessage>(OUTBOUND_BUFFER);
    let socket = AttachedSocket::new(tx);
    let (mut sink, mut stream) = ws.split();

    let admitted = match role {
        Role::Host => {
            room.accept_host(socket.clone());
            true
        }
        Role::Mobile => room.accept_mobile(socket.clone(), mobile_id.as_deref().unwrap_or("")),
    };
    if !admitted {
        // Lost the admission race after the 429 pre-check.
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: "connection limit reached".into(),
            })))
            .await;
        return;
    }

    loop {
        tokio::select! {
            _ = socket.close_requested() => {
                if let Some((code, reason)) = socket.take_close_frame() {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                }
                break;
            }
            outbound = rx.recv() => match outbound {
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => room.on_message(&socket.connection_id, text.as_str()),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    room.on_error(&socket.connection_id, &e);
                    break;
                }
                // Ping/pong are handled by the transport; binary frames are
                // not part of the wire format.
                Some(Ok(_)) => {}
            },
        }
    }

    room.on_close(&socket.connection_id);
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> DeviceRoom {
        DeviceRoom::new("swift-tiger-42", 3)
    }

    fn attach(
        room: &DeviceRoom,
        role: Role,
        mobile_id: Option<&str>,
    ) -> (Arc<AttachedSocket>, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let socket = AttachedSocket::new(tx);
        match role {
            Role::Host => room.accept_host(socket.clone()),
            Role::Mobile => {
                assert!(room.accept_mobile(socket.clone(), mobile_id.unwrap_or("m")));
            }
        }
        (socket, rx)
    }

    fn recv_text(rx: &mut mpsc::Receiver<WsMessage>) -> Value {
        loop {
            match rx.try_recv().expect("expected a frame") {
                WsMessage::Text(t) => return serde_json::from_str(t.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    #[test]
    fn register_stores_metadata_and_acks() {
        let room = room();
        let (host, mut host_rx) = attach(&room, Role::Host, None);
        room.on_message(
            &host.connection_id,
            r#"{"type":"register","payload":{"device_id":"swift-tiger-42","device_name":"laptop"}}"#,
        );

        let ack = recv_text(&mut host_rx);
        assert_eq!(ack["type"], "registered");
        assert_eq!(ack["payload"]["success"], true);
        assert_eq!(room.status_snapshot()["device_name"], "laptop");
    }

    #[test]
    fn ping_answers_pong_with_server_time() {
        let room = room();
        let (host, mut host_rx) = attach(&room, Role::Host, None);
        room.on_message(&host.connection_id, r#"{"type":"ping"}"#);
        let pong = recv_text(&mut host_rx);
        assert_eq!(pong["type"], "pong");
        assert!(pong["payload"]["time"].as_i64().unwrap() > 0);
    }

    #[test]
    fn mobile_request_gains_request_from() {
        let room = room();
        let (_host, mut host_rx) = attach(&room, Role::Host, None);
        let (mobile, _mobile_rx) = attach(&room, Role::Mobile, Some("m1"));

        room.on_message(
            &mobile.connection_id,
            r#"{"type":"session_create","payload":{"workspace_id":"w1","name":"sh"}}"#,
        );
        // Skip the mobile_connected notification.
        let mut msg = recv_text(&mut host_rx);
        if msg["type"] == "mobile_connected" {
            msg = recv_text(&mut host_rx);
        }
        assert_eq!(msg["type"], "session_create");
        assert_eq!(msg["payload"]["request_from"], "m1");
        assert_eq!(msg["payload"]["workspace_id"], "w1");
        assert!(msg["timestamp"].as_i64().is_some());
    }

    #[test]
    fn host_reply_routed_by_request_to_and_stripped() {
        let room = room();
        let (host, _host_rx) = attach(&room, Role::Host, None);
        let (_mobile, mut mobile_rx) = attach(&room, Role::Mobile, Some("m1"));

        room.on_message(
            &host.connection_id,
            r#"{"type":"session_created","payload":{"request_to":"m1","session_id":"abc","name":"sh"}}"#,
        );
        let msg = recv_text(&mut mobile_rx);
        assert_eq!(msg["type"], "session_created");
        assert_eq!(msg["payload"]["session_id"], "abc");
        assert!(msg["payload"].get("request_to").is_none());
        assert!(msg["timestamp"].as_i64().is_some());
    }

    #[test]
    fn terminal_output_routed_by_to() {
        let room = room();
        let (host, _host_rx) = attach(&room, Role::Host, None);
        let (_mobile, mut mobile_rx) = attach(&room, Role::Mobile, Some("m1"));

        room.on_message(
            &host.connection_id,
            r#"{"type":"terminal_output","payload":{"to":"m1","session_id":"abc","data":"$ "}}"#,
        );
        let msg = recv_text(&mut mobile_rx);
        assert_eq!(msg["type"], "terminal_output");
        assert_eq!(msg["payload"]["data"], "$ ");
        assert!(msg["payload"].get("to").is_none());
    }

    #[test]
    fn host_session_close_reaches_owning_mobile() {
        let room = room();
        let (host, _host_rx) = attach(&room, Role::Host, None);
        let (_mobile, mut mobile_rx) = attach(&room, Role::Mobile, Some("m1"));

        // The host reports a dead session to whoever owned it.
        room.on_message(
            &host.connection_id,
            r#"{"type":"session_close","payload":{"to":"m1","session_id":"abc"}}"#,
        );
        let msg = recv_text(&mut mobile_rx);
        assert_eq!(msg["type"], "session_close");
        assert_eq!(msg["payload"]["session_id"], "abc");
        assert!(msg["payload"].get("to").is_none());
        assert!(msg["timestamp"].as_i64().is_some());
    }

    #[test]
    fn wrong_role_messages_are_dropped() {
        let room = room();
        let (_host, mut host_rx) = attach(&room, Role::Host, None);
        let (mobile, mut mobile_rx) = attach(&room, Role::Mobile, Some("m1"));

        // A mobile may not speak host-only types.
        room.on_message(
            &mobile.connection_id,
            r#"{"type":"workspace_data","payload":{"request_to":"m1"}}"#,
        );
        assert!(mobile_rx.try_recv().is_err());

        // Drain the mobile_connected notification; nothing else arrives.
        let msg = recv_text(&mut host_rx);
        assert_eq!(msg["type"], "mobile_connected");
        assert!(host_rx.try_recv().is_err());
    }

    #[test]
    fn routing_miss_is_silent() {
        let room = room();
        let (host, mut host_rx) = attach(&room, Role::Host, None);
        room.on_message(
            &host.connection_id,
            r#"{"type":"terminal_output","payload":{"to":"nobody","data":"x"}}"#,
        );
        assert!(host_rx.try_recv().is_err());
    }

    #[test]
    fn mobile_cap_is_enforced_on_admission() {
        let room = DeviceRoom::new("swift-tiger-42", 2);
        let (_a, _arx) = attach(&room, Role::Mobile, Some("m1"));
        let (_b, _brx) = attach(&room, Role::Mobile, Some("m2"));

        let (tx, _rx) = mpsc::channel(OUTBOUND_BUFFER);
        let third = AttachedSocket::new(tx);
        assert!(!room.accept_mobile(third, "m3"));
        assert_eq!(room.live_mobile_count(), 2);
    }

    #[test]
    fn second_host_displaces_first_with_normal_close() {
        let room = room();
        let (first, _first_rx) = attach(&room, Role::Host, None);
        let (_second, _second_rx) = attach(&room, Role::Host, None);

        assert_eq!(
            first.take_close_frame(),
            Some((CLOSE_NORMAL, "Connection replaced".into()))
        );
        // Exactly one host remains in the live set.
        let snapshot = room.status_snapshot();
        assert_eq!(snapshot["host_connected"], true);
        assert_eq!(snapshot["total_sockets"], 1);
    }

    #[test]
    fn host_close_fans_out_error_and_close() {
        let room = room();
        let (host, _host_rx) = attach(&room, Role::Host, None);
        let (m1, mut m1_rx) = attach(&room, Role::Mobile, Some("m1"));
        let (m2, mut m2_rx) = attach(&room, Role::Mobile, Some("m2"));

        room.on_close(&host.connection_id);

        for (sock, rx) in [(&m1, &mut m1_rx), (&m2, &mut m2_rx)] {
            let err = recv_text(rx);
            assert_eq!(err["type"], "error");
            assert_eq!(err["payload"]["message"], "Desktop disconnected");
            assert_eq!(sock.take_close_frame().map(|f| f.0), Some(CLOSE_NORMAL));
        }

        let snapshot = room.status_snapshot();
        assert_eq!(snapshot["host_connected"], false);
    }

    #[test]
    fn mobile_close_notifies_host() {
        let room = room();
        let (_host, mut host_rx) = attach(&room, Role::Host, None);
        let (mobile, _mobile_rx) = attach(&room, Role::Mobile, Some("m1"));

        // Drain mobile_connected.
        let msg = recv_text(&mut host_rx);
        assert_eq!(msg["type"], "mobile_connected");

        room.on_close(&mobile.connection_id);
        let msg = recv_text(&mut host_rx);
        assert_eq!(msg["type"], "mobile_disconnect");
        assert_eq!(msg["payload"]["mobile_id"], "m1");
    }

    #[test]
    fn routing_survives_cache_loss() {
        let room = room();
        let (host, _host_rx) = attach(&room, Role::Host, None);
        let (_mobile, mut mobile_rx) = attach(&room, Role::Mobile, Some("m1"));

        // Suspension wipes the in-memory maps; sockets and their
        // attachments survive.
        room.drop_cached_state();

        room.on_message(
            &host.connection_id,
            r#"{"type":"terminal_output","payload":{"to":"m1","data":"after wake"}}"#,
        );
        let msg = recv_text(&mut mobile_rx);
        assert_eq!(msg["payload"]["data"], "after wake");
    }

    #[test]
    fn status_snapshot_counts_live_sockets() {
        let room = room();
        let (_host, _host_rx) = attach(&room, Role::Host, None);
        let (_m1, _m1_rx) = attach(&room, Role::Mobile, Some("m1"));

        room.drop_cached_state();

        let snapshot = room.status_snapshot();
        assert_eq!(snapshot["device_id"], "swift-tiger-42");
        assert_eq!(snapshot["host_connected"], true);
        assert_eq!(snapshot["total_sockets"], 2);
        assert_eq!(
            snapshot["mobile_attachments"][0]["mobile_id"],
            "m1"
        );
    }
}
