//! Push-socket peers: identity-keyed registry, outbound queues, and the
//! per-connection event table services fill in.
//!
//! Each peer gets a bounded mpsc channel for backpressure. The receiver end
//! is held by the socket loop; [`PeerHandle`] holds the sender end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

/// Event name broadcast when a peer joins.
pub const USER_JOIN: &str = "userJoin";
/// Event name broadcast when a peer leaves.
pub const USER_DISCONNECT: &str = "userDisconnect";
/// Liveness check answered with [`DONG`].
pub const DING: &str = "ding";
pub const DONG: &str = "dong";

/// Wire frame on a push socket: `{"event": <name>, "data": <json>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl PushEvent {
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        // A struct of a string and a `Value` always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Message to be sent outbound to a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// A serialized [`PushEvent`].
    Text(String),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

/// Error returned when sending to a peer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel stayed full for the whole timeout.
    Timeout,
    /// The socket loop exited; the receiver was dropped.
    Disconnected,
}

/// Sender side of one connected peer.
#[derive(Debug)]
pub struct PeerHandle {
    pub id: String,
    tx: mpsc::Sender<OutboundMessage>,
    pub connected_at: Instant,
}

impl PeerHandle {
    /// Enqueues without blocking. False when full or disconnected.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Sends with a timeout.
    ///
    /// # Errors
    ///
    /// `SendError::Timeout` if the channel stays full for `timeout`,
    /// `SendError::Disconnected` if the socket loop is gone.
    pub async fn send_timeout(&self, msg: OutboundMessage, timeout: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Queues `event` for this peer.
    #[must_use]
    pub fn emit(&self, event: &str, data: Value) -> bool {
        self.try_send(OutboundMessage::Text(PushEvent::new(event, data).to_text()))
    }

    /// Asks the socket loop to close the connection.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        self.try_send(OutboundMessage::Close(Some(reason.into())))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Connected peers of one push-socket listener, keyed by identity.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<String, Arc<PeerHandle>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id`. Returns `None` when that identity is already
    /// connected; the existing peer is left untouched.
    pub fn register(
        &self,
        id: &str,
        config: &ConnectionConfig,
    ) -> Option<(Arc<PeerHandle>, mpsc::Receiver<OutboundMessage>)> {
        match self.peers.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));
                let handle = Arc::new(PeerHandle {
                    id: id.to_string(),
                    tx,
                    connected_at: Instant::now(),
                });
                slot.insert(Arc::clone(&handle));
                Some((handle, rx))
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.remove(id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.get(id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.peers.len()
    }

    /// Connected identities, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Queues `event` for every peer except `except`. Full channels are
    /// skipped. Returns how many peers accepted the event.
    pub fn broadcast(&self, event: &str, data: &Value, except: Option<&str>) -> usize {
        let text = PushEvent::new(event, data.clone()).to_text();
        self.peers
            .iter()
            .filter(|entry| except != Some(entry.key().as_str()))
            .filter(|entry| entry.value().try_send(OutboundMessage::Text(text.clone())))
            .count()
    }

    /// Removes and returns every peer. Used when the listener unbinds.
    pub fn drain_all(&self) -> Vec<Arc<PeerHandle>> {
        let keys: Vec<String> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.peers.remove(&key).map(|(_, handle)| handle))
            .collect()
    }
}

/// Handler for one named push event.
pub type SocketEventHandler = Arc<dyn Fn(&PushContext, Value) + Send + Sync>;

/// What an event handler can do on the connection it was invoked for.
pub struct PushContext {
    peer: Arc<PeerHandle>,
    peers: Arc<PeerRegistry>,
}

impl PushContext {
    #[must_use]
    pub fn new(peer: Arc<PeerHandle>, peers: Arc<PeerRegistry>) -> Self {
        Self { peer, peers }
    }

    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer.id
    }

    /// Sends `event` back to this peer.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        self.peer.emit(event, data)
    }

    /// Sends `event` to every other peer on the listener.
    pub fn broadcast(&self, event: &str, data: &Value) -> usize {
        self.peers.broadcast(event, data, Some(self.peer.id.as_str()))
    }

    /// Sends `event` to every peer, this one included.
    pub fn broadcast_all(&self, event: &str, data: &Value) -> usize {
        self.peers.broadcast(event, data, None)
    }
}

/// Event table for one push connection, filled by the service hook before
/// the first inbound event is read.
pub struct SocketEvents {
    peer_id: String,
    handlers: HashMap<String, SocketEventHandler>,
}

impl SocketEvents {
    #[must_use]
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            handlers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Registers `handler` for `event`, replacing any earlier one.
    pub fn on(&mut self, event: impl Into<String>, handler: SocketEventHandler) -> &mut Self {
        self.handlers.insert(event.into(), handler);
        self
    }

    #[must_use]
    pub fn handler(&self, event: &str) -> Option<&SocketEventHandler> {
        self.handlers.get(event)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
