//! Gateway event bridge.
//!
//! Reads the agent runtime's event stream, keeps the [`RunTracker`] in
//! step with it and broadcasts the normalized push protocol through the
//! [`EventHub`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_sync_core::{
    EventHub, Message, PushEvent, Role, RunState, RunTracker, SyncConfig,
    content::extract_text,
};
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::runtime_event::{AgentEvent, ChatEvent, ChatState, RuntimeFrame};

/// Bridge error.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Live frame stream from one runtime connection.
pub type FrameStream = BoxStream<'static, Result<RuntimeFrame, BridgeError>>;

/// Opens connections to the agent runtime's event stream.
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self) -> Result<FrameStream, BridgeError>;
}

/// Translates runtime frames into push events.
#[derive(Clone)]
pub struct GatewayBridge {
    hub: Arc<EventHub>,
    runs: Arc<RunTracker>,
}

impl GatewayBridge {
    #[must_use]
    pub fn new(hub: Arc<EventHub>, runs: Arc<RunTracker>) -> Self {
        Self { hub, runs }
    }

    #[must_use]
    pub fn runs(&self) -> &Arc<RunTracker> {
        &self.runs
    }

    /// Handle one frame from the runtime.
    pub fn handle_frame(&self, frame: RuntimeFrame) {
        match frame {
            RuntimeFrame::Chat(event) => self.handle_chat(event),
            RuntimeFrame::Agent(event) => self.handle_agent(&event),
            RuntimeFrame::System(_) => {
                if !self.runs.is_empty() {
                    tracing::info!(active = self.runs.len(), "system event with runs in flight, clearing");
                    self.clear_runs();
                }
            }
        }
    }

    /// A fresh connection to the runtime: runs from the previous
    /// connection can never complete.
    pub fn on_connected(&self) {
        let cleared = self.clear_runs();
        if cleared > 0 {
            tracing::info!(cleared, "reconnected, dropped stale runs");
        }
    }

    fn clear_runs(&self) -> usize {
        let sessions = self.runs.clear();
        let count = sessions.len();
        for session_key in sessions {
            self.hub.push(PushEvent::idle(session_key));
        }
        count
    }

    fn handle_chat(&self, event: ChatEvent) {
        let text = extract_text(event.content.as_ref());
        let state = match event.state.as_deref() {
            Some(raw) => match ChatState::parse(raw) {
                Some(state) => state,
                None => {
                    tracing::debug!(state = raw, "ignoring chat event with unknown state");
                    return;
                }
            },
            // Non-conforming producers send bare text for a completed answer.
            None if !text.is_empty() => ChatState::Final,
            None => return,
        };
        let run_id = event.run_id.unwrap_or_default();
        let session_key = event.session_key;

        match state {
            ChatState::Started => {
                if !run_id.is_empty() {
                    self.runs.observe(&run_id, &session_key, RunState::Started);
                }
            }
            ChatState::Delta => {
                if text.is_empty() {
                    return;
                }
                if !run_id.is_empty() {
                    self.runs.observe(&run_id, &session_key, RunState::Streaming);
                }
                self.hub.push(PushEvent::Token {
                    token: text,
                    run_id,
                    session_key,
                    seq: event.seq,
                });
            }
            ChatState::Final => {
                self.runs.finish(&run_id);
                if text.is_empty() {
                    tracing::debug!(%run_id, "final event without text");
                } else {
                    let id = if run_id.is_empty() {
                        Uuid::new_v4().to_string()
                    } else {
                        run_id
                    };
                    self.hub.push(PushEvent::Message(Message::new(
                        id,
                        Role::Assistant,
                        text,
                        session_key.clone(),
                    )));
                }
                self.hub.push(PushEvent::idle(session_key));
            }
            ChatState::Error => {
                self.runs.finish(&run_id);
                let error = event
                    .error_message
                    .filter(|e| !e.trim().is_empty())
                    .or_else(|| (!text.is_empty()).then_some(text))
                    .unwrap_or_else(|| "Agent run failed".to_string());
                tracing::warn!(%run_id, %session_key, %error, "run failed");
                self.hub.push(PushEvent::error(session_key.clone(), error));
                self.hub.push(PushEvent::idle(session_key));
            }
            ChatState::Aborted => {
                self.runs.finish(&run_id);
                self.hub.push(PushEvent::Status {
                    status: chat_sync_core::AgentStatus::Idle,
                    session_key,
                    aborted: true,
                });
            }
        }
    }

    fn handle_agent(&self, event: &AgentEvent) {
        match event.status.as_str() {
            "running" | "thinking" => self.hub.push(PushEvent::thinking(event.session_key.clone())),
            "idle" | "done" => self.hub.push(PushEvent::idle(event.session_key.clone())),
            other => tracing::debug!(status = other, "ignoring agent status"),
        }
    }

    /// Connect, consume and reconnect until `shutdown` fires.
    ///
    /// The delay between connection attempts doubles from
    /// `reconnect_min` up to `reconnect_max` and resets after every
    /// successful connect.
    pub async fn run<C>(&self, connector: &C, config: &SyncConfig, mut shutdown: oneshot::Receiver<()>)
    where
        C: RuntimeConnector + ?Sized,
    {
        let min = config.reconnect_min();
        let max = config.reconnect_max().max(min);
        let mut backoff = min;

        loop {
            let connected = tokio::select! {
                res = connector.connect() => res,
                _ = &mut shutdown => return,
            };

            match connected {
                Ok(mut frames) => {
                    tracing::info!("connected to agent runtime");
                    self.on_connected();
                    backoff = min;

                    loop {
                        tokio::select! {
                            next = frames.next() => match next {
                                Some(Ok(frame)) => self.handle_frame(frame),
                                Some(Err(e)) => {
                                    tracing::warn!("runtime stream error: {e}");
                                    break;
                                }
                                None => {
                                    tracing::info!("runtime stream ended");
                                    break;
                                }
                            },
                            _ = &mut shutdown => return,
                        }
                    }
                }
                Err(e) => tracing::warn!("runtime connect failed: {e}"),
            }

            tracing::debug!(?backoff, "reconnecting to agent runtime");
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = &mut shutdown => return,
            }
            backoff = next_backoff(backoff, max);
        }
    }

    /// Spawn [`run`](Self::run) on the runtime. Dropping or firing the
    /// returned sender stops the bridge.
    pub fn spawn<C>(
        self,
        connector: Arc<C>,
        config: SyncConfig,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>)
    where
        C: RuntimeConnector + ?Sized + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            self.run(connector.as_ref(), &config, shutdown_rx).await;
        });
        (shutdown_tx, handle)
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::broadcast;

    use super::*;

    fn bridge() -> (GatewayBridge, broadcast::Receiver<PushEvent>) {
        let hub = Arc::new(EventHub::new());
        let rx = hub.subscribe();
        (GatewayBridge::new(hub, Arc::new(RunTracker::new())), rx)
    }

    fn chat(value: serde_json::Value) -> RuntimeFrame {
        RuntimeFrame::Chat(serde_json::from_value(value).unwrap())
    }

    fn drain(rx: &mut broadcast::Receiver<PushEvent>) -> Vec<PushEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_delta_registers_run_and_emits_token() {
        let (bridge, mut rx) = bridge();
        bridge.handle_frame(chat(json!({
            "state": "delta", "runId": "r1", "sessionKey": "main",
            "content": [{"type": "text", "text": "He"}], "seq": 1
        })));

        assert!(bridge.runs().is_active("r1"));
        assert_eq!(
            drain(&mut rx),
            vec![PushEvent::Token {
                token: "He".into(),
                run_id: "r1".into(),
                session_key: "main".into(),
                seq: Some(1),
            }]
        );
    }

    #[test]
    fn test_empty_delta_is_dropped() {
        let (bridge, mut rx) = bridge();
        bridge.handle_frame(chat(json!({"state": "delta", "runId": "r1", "sessionKey": "main", "content": {"delta": ""}})));
        assert!(bridge.runs().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_final_emits_message_then_idle() {
        let (bridge, mut rx) = bridge();
        bridge.handle_frame(chat(json!({"state": "delta", "runId": "r1", "sessionKey": "main", "content": "Hel"})));
        bridge.handle_frame(chat(json!({"state": "final", "runId": "r1", "sessionKey": "main", "content": "Hello there!"})));

        assert!(bridge.runs().is_empty());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        let PushEvent::Message(message) = &events[1] else {
            panic!("expected message, got {:?}", events[1]);
        };
        assert_eq!(message.id, "r1");
        assert_eq!(message.content, "Hello there!");
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(events[2], PushEvent::idle("main"));
    }

    #[test]
    fn test_stateless_text_is_treated_as_final() {
        let (bridge, mut rx) = bridge();
        bridge.handle_frame(chat(json!({"runId": "r9", "sessionKey": "main", "content": {"text": "done"}})));
        let events = drain(&mut rx);
        assert!(matches!(&events[0], PushEvent::Message(m) if m.id == "r9" && m.content == "done"));
        assert_eq!(events[1], PushEvent::idle("main"));

        bridge.handle_frame(chat(json!({"runId": "r10", "sessionKey": "main"})));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_error_and_aborted() {
        let (bridge, mut rx) = bridge();
        bridge.handle_frame(chat(json!({"state": "delta", "runId": "r1", "sessionKey": "a", "content": "x"})));
        bridge.handle_frame(chat(json!({"state": "error", "runId": "r1", "sessionKey": "a", "errorMessage": "quota"})));
        bridge.handle_frame(chat(json!({"state": "aborted", "runId": "r2", "sessionKey": "b"})));

        assert!(bridge.runs().is_empty());
        let events = drain(&mut rx);
        assert_eq!(
            &events[1..],
            &[
                PushEvent::error("a", "quota"),
                PushEvent::idle("a"),
                PushEvent::Status {
                    status: chat_sync_core::AgentStatus::Idle,
                    session_key: "b".into(),
                    aborted: true,
                },
            ]
        );
    }

    #[test]
    fn test_system_event_clears_active_runs() {
        let (bridge, mut rx) = bridge();
        bridge.handle_frame(RuntimeFrame::System(json!({"text": "restarted"})));
        assert!(drain(&mut rx).is_empty());

        bridge.handle_frame(chat(json!({"state": "delta", "runId": "r1", "sessionKey": "a", "content": "x"})));
        bridge.handle_frame(chat(json!({"state": "delta", "runId": "r2", "sessionKey": "a", "content": "y"})));
        drain(&mut rx);

        bridge.handle_frame(RuntimeFrame::System(json!({"text": "restarted"})));
        assert!(bridge.runs().is_empty());
        assert_eq!(drain(&mut rx), vec![PushEvent::idle("a")]);
    }

    #[test]
    fn test_agent_status_mapping() {
        let (bridge, mut rx) = bridge();
        for status in ["running", "idle", "paused"] {
            bridge.handle_frame(RuntimeFrame::Agent(AgentEvent {
                session_key: "main".into(),
                status: status.into(),
            }));
        }
        assert_eq!(
            drain(&mut rx),
            vec![PushEvent::thinking("main"), PushEvent::idle("main")]
        );
    }

    #[test]
    fn test_backoff_caps() {
        let max = Duration::from_secs(4);
        assert_eq!(next_backoff(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(3), max), max);
    }
}
