//! Push-socket connections: identity, join/leave broadcasts, and event
//! dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use switchyard_core::{LogLevel, LogSink, TransportType};
use uuid::Uuid;

use crate::network::config::ConnectionConfig;
use crate::network::connection::{
    OutboundMessage, PeerHandle, PeerRegistry, PushContext, PushEvent, SocketEvents, DING, DONG, USER_DISCONNECT, USER_JOIN,
};
use crate::network::shutdown::DrainController;
use crate::service::routes::RouteError;
use crate::traits::MeshService;

/// Event sent to a peer whose frame could not be handled.
pub const ERROR_EVENT: &str = "error";

/// Shared state of one push-socket listener.
#[derive(Clone)]
pub struct PushState {
    pub service: Arc<dyn MeshService>,
    pub peers: Arc<PeerRegistry>,
    pub drain: Arc<DrainController>,
    pub connection: ConnectionConfig,
    pub log: Arc<dyn LogSink>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PushParams {
    /// Requested peer identity. A UUID is assigned when absent.
    pub peer: Option<String>,
}

/// Upgrades any path on the listener to a push socket.
pub async fn ws_upgrade_handler(
    State(state): State<PushState>,
    Query(params): Query<PushParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.drain.is_accepting() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let peer_id = params
        .peer
        .filter(|peer| !peer.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer_id))
}

async fn handle_socket(mut socket: WebSocket, state: PushState, peer_id: String) {
    let namespace = state.service.namespace().to_string();
    let Some((peer, mut outbound)) = state.peers.register(&peer_id, &state.connection) else {
        state.log.log(
            "Network:pushSocket",
            LogLevel::Warning,
            &format!("Refused duplicate peer identity {peer_id} on {namespace}"),
            Some(&json!({ "namespace": namespace, "peer": peer_id })),
            None,
        );
        let refusal = PushEvent::new(ERROR_EVENT, json!({ "error": "duplicate peer identity" }));
        let _ = socket.send(Message::Text(refusal.to_text().into())).await;
        let _ = socket.send(close_frame(close_code::POLICY, "duplicate peer identity")).await;
        return;
    };
    let _guard = state.drain.in_flight_guard();
    let _departure = Departure {
        peers: Arc::clone(&state.peers),
        peer: Arc::clone(&peer),
        peer_id: peer_id.clone(),
        namespace: namespace.clone(),
        log: Arc::clone(&state.log),
    };

    state.peers.broadcast(USER_JOIN, &json!({ "peer": peer_id }), None);
    state.log.note(
        "Network:pushSocket",
        LogLevel::Debug,
        &format!("Peer {peer_id} joined {namespace}"),
    );

    let mut events = SocketEvents::new(peer_id.clone());
    state.service.socket_events(&mut events);
    let ctx = PushContext::new(Arc::clone(&peer), Arc::clone(&state.peers));

    let drained = state.drain.drained();
    tokio::pin!(drained);

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => dispatch_event(&state, &events, &ctx, text.as_str()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            queued = outbound.recv() => match queued {
                Some(OutboundMessage::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundMessage::Close(reason)) => {
                    let reason = reason.unwrap_or_default();
                    let _ = socket.send(close_frame(close_code::AWAY, &reason)).await;
                    break;
                }
                None => break,
            },
            () = &mut drained => {
                let _ = socket.send(close_frame(close_code::AWAY, "service unbound")).await;
                break;
            }
        }
    }
}

/// Removes the peer and announces its departure when the connection task
/// ends, including by unwinding.
struct Departure {
    peers: Arc<PeerRegistry>,
    peer: Arc<PeerHandle>,
    peer_id: String,
    namespace: String,
    log: Arc<dyn LogSink>,
}

impl Drop for Departure {
    fn drop(&mut self) {
        // The listener may already have drained the registry on unbind.
        let still_registered = self
            .peers
            .get(&self.peer_id)
            .is_some_and(|current| Arc::ptr_eq(&current, &self.peer));
        if still_registered {
            self.peers.remove(&self.peer_id);
        }
        self.peers
            .broadcast(USER_DISCONNECT, &json!({ "peer": self.peer_id }), None);
        self.log.note(
            "Network:pushSocket",
            LogLevel::Debug,
            &format!("Peer {} left {}", self.peer_id, self.namespace),
        );
    }
}

/// `ding` is answered here; hooked events go to their handler; everything
/// else is routed as a `webSocket` call and the result echoed back under
/// the same event name.
fn dispatch_event(state: &PushState, events: &SocketEvents, ctx: &PushContext, text: &str) {
    let event: PushEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            state.log.log(
                "Network:pushSocket",
                LogLevel::ClientFault,
                &format!("Malformed push frame from {}: {err}", ctx.peer_id()),
                Some(&json!({ "namespace": state.service.namespace(), "peer": ctx.peer_id() })),
                None,
            );
            ctx.emit(ERROR_EVENT, json!({ "error": "malformed event" }));
            return;
        }
    };

    if event.event == DING {
        ctx.emit(DONG, event.data);
        return;
    }
    if let Some(handler) = events.handler(&event.event) {
        if catch_unwind(AssertUnwindSafe(|| handler(ctx, event.data))).is_err() {
            state.log.log(
                "Network:pushSocket",
                LogLevel::ServerFault,
                &format!("Socket event handler {} panicked", event.event),
                Some(&json!({ "namespace": state.service.namespace(), "event": event.event })),
                None,
            );
            ctx.emit(ERROR_EVENT, json!({ "error": "internal error", "event": event.event }));
        }
        return;
    }

    match state
        .service
        .routes()
        .route(TransportType::WebSocket, &event.event, vec![event.data])
    {
        Ok(reply) => {
            ctx.emit(&event.event, reply);
        }
        Err(RouteError::HandlerFailed { .. }) => {
            ctx.emit(ERROR_EVENT, json!({ "error": "internal error", "event": event.event }));
        }
        Err(_) => {
            ctx.emit(ERROR_EVENT, json!({ "error": "not found", "event": event.event }));
        }
    }
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}


#[cfg(test)]
mod tests {
    use switchyard_core::MemoryLogSink;

    use super::*;

    #[tokio::test]
    async fn departure_runs_when_connection_task_panics() {
        let peers = Arc::new(PeerRegistry::new());
        let config = ConnectionConfig::default();
        let (_watcher, mut watcher_rx) = peers.register("watcher", &config).unwrap();
        let (erin, _erin_rx) = peers.register("erin", &config).unwrap();

        let departure = Departure {
            peers: Arc::clone(&peers),
            peer: erin,
            peer_id: "erin".to_string(),
            namespace: "echo".to_string(),
            log: Arc::new(MemoryLogSink::new()),
        };
        let task = tokio::spawn(async move {
            let _departure = departure;
            panic!("handler blew up");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert!(peers.get("erin").is_none());
        assert!(peers.register("erin", &config).is_some());
        match watcher_rx.recv().await {
            Some(OutboundMessage::Text(text)) => {
                let event: PushEvent = serde_json::from_str(&text).unwrap();
                assert_eq!(event.event, USER_DISCONNECT);
                assert_eq!(event.data, json!({ "peer": "erin" }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn departure_leaves_a_newer_peer_in_place() {
        let peers = Arc::new(PeerRegistry::new());
        let config = ConnectionConfig::default();
        let (stale, _rx) = peers.register("frank", &config).unwrap();
        peers.remove("frank");
        let (fresh, _fresh_rx) = peers.register("frank", &config).unwrap();

        drop(Departure {
            peers: Arc::clone(&peers),
            peer: stale,
            peer_id: "frank".to_string(),
            namespace: "echo".to_string(),
            log: Arc::new(MemoryLogSink::new()),
        });
        assert!(Arc::ptr_eq(&peers.get("frank").unwrap(), &fresh));
    }
}
