//! Server half of the session controller: forwards client requests to
//! the runtime's chat RPCs.

use std::{sync::Arc, time::Duration};

use chat_sync_core::{
    ClientRequest, EventHub, Gateway, GatewayError, Message, PushEvent, RequestSink, Role,
    RunTracker, SyncConfig, TransportError, content::extract_text, traits::ChatSendResult,
};

/// Dispatches `send`/`abort` requests to the gateway.
#[derive(Clone)]
pub struct ChatService {
    gateway: Arc<dyn Gateway>,
    hub: Arc<EventHub>,
    runs: Arc<RunTracker>,
    send_timeout: Duration,
    rpc_timeout: Duration,
}

impl ChatService {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn Gateway>,
        hub: Arc<EventHub>,
        runs: Arc<RunTracker>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            gateway,
            hub,
            runs,
            send_timeout: config.send_timeout(),
            rpc_timeout: config.rpc_timeout(),
        }
    }

    /// Handle a client request. Failures are broadcast to the session
    /// as `error` events and logged; nothing propagates.
    pub async fn handle(&self, request: ClientRequest) {
        match request {
            ClientRequest::Send {
                session_key,
                message,
                idempotency_key,
            } => {
                let _ = self.send(&session_key, &message, &idempotency_key).await;
            }
            ClientRequest::Abort { session_key } => {
                if let Err(e) = self.abort(&session_key).await {
                    tracing::warn!(%session_key, "abort failed: {e}");
                }
            }
        }
    }

    /// Start a run via `chat.send`.
    ///
    /// # Errors
    /// Returns the RPC error, or [`GatewayError::Timeout`] past the send
    /// deadline. Either is also broadcast to the session.
    pub async fn send(
        &self,
        session_key: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<ChatSendResult, GatewayError> {
        let rpc = self.gateway.send_chat(session_key, message, idempotency_key);
        let result = match tokio::time::timeout(self.send_timeout, rpc).await {
            Ok(res) => res,
            Err(_) => Err(GatewayError::Timeout(self.send_timeout)),
        };

        match result {
            Ok(ack) => {
                tracing::debug!(%session_key, run_id = ?ack.run_id, status = ?ack.status, "chat.send accepted");
                self.broadcast_inline_reply(session_key, idempotency_key, &ack);
                Ok(ack)
            }
            Err(e) => {
                tracing::warn!(%session_key, %idempotency_key, "chat.send failed: {e}");
                self.hub.push(PushEvent::error(session_key, e.to_string()));
                Err(e)
            }
        }
    }

    /// Ask the runtime to stop the session's run. Best-effort: the
    /// runtime may keep generating.
    ///
    /// # Errors
    /// Returns the RPC error or a timeout.
    pub async fn abort(&self, session_key: &str) -> Result<(), GatewayError> {
        match tokio::time::timeout(self.rpc_timeout, self.gateway.abort_chat(session_key)).await {
            Ok(res) => res,
            Err(_) => Err(GatewayError::Timeout(self.rpc_timeout)),
        }
    }

    /// Runtimes that answer inline never emit a `final` event, so the
    /// answer is broadcast here unless the event path owns the run.
    fn broadcast_inline_reply(&self, session_key: &str, idempotency_key: &str, ack: &ChatSendResult) {
        let text = extract_text(ack.content.as_ref());
        if text.is_empty() || ack.is_in_flight() {
            return;
        }
        if ack.run_id.as_deref().is_some_and(|run_id| self.runs.is_active(run_id)) {
            return;
        }

        let id = ack
            .run_id
            .clone()
            .unwrap_or_else(|| idempotency_key.to_string());
        tracing::debug!(%session_key, %id, "broadcasting inline reply");
        self.hub.push(PushEvent::Message(Message::new(
            id,
            Role::Assistant,
            text,
            session_key,
        )));
        self.hub.push(PushEvent::idle(session_key));
    }
}

/// In-process request channel: each request runs on its own task.
impl RequestSink for ChatService {
    fn send(&self, request: ClientRequest) -> Result<(), TransportError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let service = self.clone();
        handle.spawn(async move { service.handle(request).await });
        Ok(())
    }
}
