//! Transport-held socket handles.
//!
//! Each live WebSocket is represented by an [`AttachedSocket`]: a bounded
//! outbound sender plus the connection's attachment metadata serialised onto
//! the handle itself as JSON. The [`SocketRegistry`] is the transport's list
//! of live sockets — the ground truth a room consults whenever its in-memory
//! cache is empty after a wake-up.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

use super::message::Envelope;

/// Outbound frames buffered per socket before the sender counts as slow.
pub const OUTBOUND_BUFFER: usize = 128;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Try again later — used when an admission race or backpressure forces a
/// post-upgrade disconnect.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Which side of the relay a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Mobile,
}

/// Per-socket attachment metadata. Persisted on the socket handle so routing
/// tables can be rebuilt from live sockets alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub connection_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_id: Option<String>,
    /// Milliseconds since epoch.
    pub connected_at: i64,
    /// Milliseconds since epoch; bumped on every message.
    pub last_activity: i64,
}

impl Attachment {
    pub fn host(connection_id: &str) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            connection_id: connection_id.to_string(),
            role: Role::Host,
            mobile_id: None,
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn mobile(connection_id: &str, mobile_id: &str) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            connection_id: connection_id.to_string(),
            role: Role::Mobile,
            mobile_id: Some(mobile_id.to_string()),
            connected_at: now,
            last_activity: now,
        }
    }
}

/// A live socket as the room sees it: an id, a bounded outbound channel, and
/// the serialised attachment. Closing is signalled through the handle so it
/// works even when the outbound channel is full.
pub struct AttachedSocket {
    pub connection_id: String,
    tx: mpsc::Sender<Message>,
    attachment: Mutex<Option<String>>,
    close_frame: Mutex<Option<(u16, String)>>,
    close_notify: Notify,
}

impl AttachedSocket {
    pub fn new(tx: mpsc::Sender<Message>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            tx,
            attachment: Mutex::new(None),
            close_frame: Mutex::new(None),
            close_notify: Notify::new(),
        })
    }

    /// Persist attachment metadata onto the socket handle.
    pub fn store_attachment(&self, attachment: &Attachment) {
        *lock(&self.attachment) = serde_json::to_string(attachment).ok();
    }

    /// Deserialise the attachment persisted on this socket, if any.
    pub fn attachment(&self) -> Option<Attachment> {
        lock(&self.attachment)
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Queue an envelope without blocking. Returns `false` when the socket's
    /// buffer is full or the connection is gone.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.tx
            .try_send(Message::Text(envelope.to_text().into()))
            .is_ok()
    }

    /// Request a graceful close. The connection task sends the frame and
    /// tears the socket down; callers never block here.
    pub fn close(&self, code: u16, reason: &str) {
        let mut frame = lock(&self.close_frame);
        if frame.is_none() {
            *frame = Some((code, reason.to_string()));
        }
        drop(frame);
        self.close_notify.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been requested.
    pub async fn close_requested(&self) {
        self.close_notify.notified().await;
    }

    /// The close frame set by [`close`](Self::close), if any.
    pub fn take_close_frame(&self) -> Option<(u16, String)> {
        lock(&self.close_frame).take()
    }
}

/// Mutex guard that shrugs off poisoning — socket metadata stays readable
/// even if a task panicked mid-update.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The transport's list of live sockets for one room.
#[derive(Default)]
pub struct SocketRegistry {
    sockets: Mutex<HashMap<String, std::sync::Arc<AttachedSocket>>>,
}

impl SocketRegistry {
    pub fn insert(&self, socket: std::sync::Arc<AttachedSocket>) {
        lock(&self.sockets).insert(socket.connection_id.clone(), socket);
    }

    /// Insert only while `admit` holds over the current live set. The check
    /// and the insert happen under one lock so concurrent admissions cannot
    /// both slip past a cap.
    pub fn insert_guarded(
        &self,
        socket: std::sync::Arc<AttachedSocket>,
        admit: impl FnOnce(&[std::sync::Arc<AttachedSocket>]) -> bool,
    ) -> bool {
        let mut sockets = lock(&self.sockets);
        let live: Vec<_> = sockets.values().cloned().collect();
        if !admit(&live) {
            return false;
        }
        sockets.insert(socket.connection_id.clone(), socket);
        true
    }

    pub fn get(&self, connection_id: &str) -> Option<std::sync::Arc<AttachedSocket>> {
        lock(&self.sockets).get(connection_id).cloned()
    }

    pub fn remove(&self, connection_id: &str) -> Option<std::sync::Arc<AttachedSocket>> {
        lock(&self.sockets).remove(connection_id)
    }

    /// Clone out the current live set.
    pub fn snapshot(&self) -> Vec<std::sync::Arc<AttachedSocket>> {
        lock(&self.sockets).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.sockets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_socket() -> std::sync::Arc<AttachedSocket> {
        let (tx, _rx) = mpsc::channel(OUTBOUND_BUFFER);
        AttachedSocket::new(tx)
    }

    #[test]
    fn attachment_round_trips_through_the_socket() {
        let socket = test_socket();
        assert!(socket.attachment().is_none());

        let att = Attachment::mobile(&socket.connection_id, "aabb");
        socket.store_attachment(&att);
        assert_eq!(socket.attachment(), Some(att));
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(test_socket().connection_id, test_socket().connection_id);
    }

    #[test]
    fn guarded_insert_enforces_cap_atomically() {
        let registry = SocketRegistry::default();
        let cap = 2;
        let admit = |live: &[std::sync::Arc<AttachedSocket>]| live.len() < cap;

        assert!(registry.insert_guarded(test_socket(), admit));
        assert!(registry.insert_guarded(test_socket(), admit));
        assert!(!registry.insert_guarded(test_socket(), admit));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn close_request_is_sticky() {
        let socket = test_socket();
        socket.close(CLOSE_NORMAL, "first");
        socket.close(CLOSE_TRY_AGAIN_LATER, "second");
        // First frame wins; the notify permit is stored for a later waiter.
        assert_eq!(socket.take_close_frame(), Some((CLOSE_NORMAL, "first".into())));
    }
}
