//! WebSocket push channel for browser clients.
//!
//! Every socket receives every push event; clients discard events for
//! sessions they are not showing.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use chat_sync_bridge::ChatService;
use chat_sync_core::{ClientRequest, EventHub, PushEvent, RateTracker, RequestSink};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ClientMessage, Control, ServerMessage};

/// Notice sent when a client exceeds its send budget.
pub const RATE_LIMITED: &str = "Rate limit exceeded, try again shortly";

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<EventHub>,
    pub chat: ChatService,
    pub rate: Arc<RateTracker>,
}

impl WsState {
    #[must_use]
    pub const fn new(hub: Arc<EventHub>, chat: ChatService, rate: Arc<RateTracker>) -> Self {
        Self { hub, chat, rate }
    }

    /// Apply the per-client send budget, then hand the request to the
    /// bridge. Returns the event to send back to this client alone, if any.
    fn dispatch(&self, client_id: &str, request: ClientRequest) -> Option<PushEvent> {
        if matches!(request, ClientRequest::Send { .. }) && !self.rate.check(client_id) {
            tracing::warn!(%client_id, "send rate limit exceeded");
            return Some(PushEvent::error(request.session_key(), RATE_LIMITED));
        }
        match RequestSink::send(&self.chat, request.clone()) {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(%client_id, "request not dispatched: {e}");
                Some(PushEvent::error(
                    request.session_key(),
                    format!("Message not delivered: {e}"),
                ))
            }
        }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let client_id = Uuid::new_v4().to_string();
    tracing::info!(%client_id, "push client connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies meant for this client only
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut events = state.hub.stream();

    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(event) = events.next() => ServerMessage::Event(event),
                Some(msg) = rx.recv() => msg,
                else => break,
            };
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(%client_id, "WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%client_id, "Invalid client message: {e}");
                let _ = tx.send(
                    Control::Invalid {
                        message: format!("Invalid message: {e}"),
                    }
                    .into(),
                );
                continue;
            }
        };

        match client_msg.into_request() {
            Some(request) => {
                if let Some(reply) = state.dispatch(&client_id, request) {
                    let _ = tx.send(reply.into());
                }
            }
            None => {
                let _ = tx.send(Control::Pong.into());
            }
        }
    }

    send_task.abort();
    state.rate.prune();
    tracing::info!(%client_id, "push client disconnected");
}

/// Create the WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(WsState::new(hub, chat, rate)));
/// ```
#[must_use]
pub fn create_ws_router(state: WsState) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_sync_bridge::MemoryGateway;
    use chat_sync_core::{RunTracker, SyncConfig};

    use super::*;

    fn state(limit: usize) -> WsState {
        let hub = Arc::new(EventHub::new());
        let chat = ChatService::new(
            Arc::new(MemoryGateway::new()),
            Arc::clone(&hub),
            Arc::new(RunTracker::new()),
            &SyncConfig::default(),
        );
        WsState::new(hub, chat, Arc::new(RateTracker::new(limit, Duration::from_secs(60))))
    }

    fn send(session_key: &str) -> ClientRequest {
        ClientRequest::Send {
            session_key: session_key.into(),
            message: "Hi".into(),
            idempotency_key: Uuid::new_v4().to_string(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_rate_limits_sends_per_client() {
        let state = state(2);
        assert_eq!(state.dispatch("a", send("main")), None);
        assert_eq!(state.dispatch("a", send("main")), None);

        let rejected = state.dispatch("a", send("main"));
        assert_eq!(rejected, Some(PushEvent::error("main", RATE_LIMITED)));

        // Other clients and aborts are not affected.
        assert_eq!(state.dispatch("b", send("main")), None);
        let abort = ClientRequest::Abort {
            session_key: "main".into(),
        };
        assert_eq!(state.dispatch("a", abort), None);
    }
}
