//! WebSocket live feed
//!
//! Bridges hub subscriptions onto `GET /ws`: each upgraded socket gets
//! its own hub subscription and forwards every admitted payload as one
//! text frame. Delivery is at-least-once at the history/live boundary,
//! so a per-connection seqno gate drops anything not strictly newer
//! than the last unit sent. Incoming client frames are drained and
//! ignored except Close.

use crate::hub::HubHandle;
use crate::render::{self, WireEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::stream::StreamExt;
use tracing::{debug, info};

#[derive(Clone)]
pub struct WsState {
    pub hub: HubHandle,
}

/// Router exposing the live feed at `GET /ws`.
pub fn router(state: WsState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsState) {
    let mut sub = match state.hub.subscribe().await {
        Some(s) => s,
        None => return,
    };
    let id = sub.id();
    info!(subscriber = id, "Viewer connected");

    let mut gate = SeqnoGate::default();
    loop {
        tokio::select! {
            delivery = sub.recv() => match delivery {
                Some(payload) => {
                    if !gate.admit(&payload) {
                        continue;
                    }
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                // Evicted by the hub, or the hub is gone.
                None => break,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    state.hub.unsubscribe(id);
    info!(subscriber = id, "Viewer disconnected");
}

/// Duplicate gate. Units with no seqno (init) always pass; everything
/// else must carry a strictly increasing seqno.
#[derive(Default)]
struct SeqnoGate {
    last: Option<u64>,
}

impl SeqnoGate {
    fn admit(&mut self, payload: &str) -> bool {
        let seqno = render::split_units(payload)
            .and_then(|units| units.first().and_then(|unit| WireEvent::parse(unit)))
            .and_then(|event| event.seqno);
        match seqno {
            None => true,
            Some(s) => {
                if self.last.map_or(false, |prev| s <= prev) {
                    debug!(seqno = s, "Dropping duplicate delivery");
                    false
                } else {
                    self.last = Some(s);
                    true
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Identity, SessionHeader};

    #[test]
    fn test_seqno_gate_drops_replayed_units() {
        let mut gate = SeqnoGate::default();
        let a = render::command_message("x <- 1", 0);
        let b = render::console_message(&["[1] 1".to_string()], 1);

        assert!(gate.admit(&a));
        assert!(gate.admit(&b));
        assert!(!gate.admit(&b), "repeated unit must be dropped");
        assert!(!gate.admit(&a), "older unit must be dropped");

        let c = render::comment_message("note", 2);
        assert!(gate.admit(&c));
    }

    #[test]
    fn test_seqno_gate_passes_init_and_unframed_text() {
        let mut gate = SeqnoGate::default();
        let header = SessionHeader::new(&Identity::new("u", "h"), "/tmp/x.book");
        let init = render::init_message(&header);

        assert!(gate.admit(&init));
        assert!(gate.admit(&init), "init carries no seqno");
        assert!(gate.admit("not length-prefixed"));
    }
}
