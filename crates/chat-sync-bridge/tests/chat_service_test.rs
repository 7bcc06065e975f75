//! Send/abort forwarding and the inline-reply fallback.

use std::{sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use chat_sync_bridge::ChatService;
use chat_sync_core::{
    ClientRequest, EventHub, Gateway, GatewayError, HistoryEntry, PushEvent, RunState, RunTracker,
    SessionKey, SyncConfig,
    traits::{ChatSendResult, ConfigSnapshot, SessionSummary},
};
use serde_json::Value;
use tokio::sync::broadcast;

/// Gateway whose `chat.send` answers with a fixed acknowledgement.
struct AckGateway {
    ack: ChatSendResult,
    delay: Duration,
    sends: Mutex<Vec<(String, String, String)>>,
    aborts: Mutex<Vec<String>>,
}

impl AckGateway {
    fn new(ack: ChatSendResult) -> Self {
        Self {
            ack,
            delay: Duration::ZERO,
            sends: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Gateway for AckGateway {
    async fn get_history(&self, _: &str, _: usize) -> Result<Vec<HistoryEntry>, GatewayError> {
        Ok(Vec::new())
    }

    async fn reset_session(&self, _: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn default_session(&self) -> Result<SessionKey, GatewayError> {
        Ok("main".into())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError> {
        Ok(Vec::new())
    }

    async fn get_config(&self) -> Result<ConfigSnapshot, GatewayError> {
        Err(GatewayError::Rpc("unsupported".into()))
    }

    async fn patch_config(&self, _: &Value, _: &str) -> Result<ConfigSnapshot, GatewayError> {
        Err(GatewayError::Rpc("unsupported".into()))
    }

    async fn send_chat(
        &self,
        session_key: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<ChatSendResult, GatewayError> {
        self.sends.lock().unwrap().push((
            session_key.to_string(),
            message.to_string(),
            idempotency_key.to_string(),
        ));
        tokio::time::sleep(self.delay).await;
        Ok(self.ack.clone())
    }

    async fn abort_chat(&self, session_key: &str) -> Result<(), GatewayError> {
        self.aborts.lock().unwrap().push(session_key.to_string());
        Ok(())
    }
}

fn service(
    gateway: Arc<AckGateway>,
    runs: Arc<RunTracker>,
) -> (ChatService, broadcast::Receiver<PushEvent>) {
    let hub = Arc::new(EventHub::new());
    let rx = hub.subscribe();
    let config = SyncConfig {
        send_timeout_ms: 1_000,
        ..SyncConfig::default()
    };
    (ChatService::new(gateway, hub, runs, &config), rx)
}

fn inline_ack(status: &str) -> ChatSendResult {
    ChatSendResult {
        run_id: Some("r1".into()),
        status: Some(status.into()),
        content: Some("Inline answer".into()),
    }
}

fn drain(rx: &mut broadcast::Receiver<PushEvent>) -> Vec<PushEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[tokio::test]
async fn test_inline_reply_is_broadcast_when_run_not_tracked() {
    let gateway = Arc::new(AckGateway::new(inline_ack("ok")));
    let (service, mut rx) = service(Arc::clone(&gateway), Arc::new(RunTracker::new()));

    service
        .handle(ClientRequest::Send {
            session_key: "main".into(),
            message: "Hi".into(),
            idempotency_key: "k1".into(),
        })
        .await;

    assert_eq!(
        gateway.sends.lock().unwrap().as_slice(),
        &[("main".to_string(), "Hi".to_string(), "k1".to_string())]
    );
    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], PushEvent::Message(m) if m.id == "r1" && m.content == "Inline answer"));
    assert_eq!(events[1], PushEvent::idle("main"));
}

#[tokio::test]
async fn test_inline_reply_suppressed_while_event_path_owns_run() {
    let runs = Arc::new(RunTracker::new());
    runs.observe("r1", "main", RunState::Streaming);
    let (service, mut rx) = service(Arc::new(AckGateway::new(inline_ack("ok"))), runs);

    tokio_test::assert_ok!(service.send("main", "Hi", "k1").await);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_inline_reply_suppressed_for_started_status() {
    for status in ["started", "in_flight"] {
        let (service, mut rx) = service(
            Arc::new(AckGateway::new(inline_ack(status))),
            Arc::new(RunTracker::new()),
        );
        tokio_test::assert_ok!(service.send("main", "Hi", "k1").await);
        assert!(drain(&mut rx).is_empty(), "status {status}");
    }
}

#[tokio::test]
async fn test_plain_ack_broadcasts_nothing() {
    let ack = ChatSendResult {
        run_id: Some("r1".into()),
        status: Some("started".into()),
        content: None,
    };
    let (service, mut rx) = service(Arc::new(AckGateway::new(ack)), Arc::new(RunTracker::new()));
    tokio_test::assert_ok!(service.send("main", "Hi", "k1").await);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_is_retryable_and_broadcast() {
    let mut gateway = AckGateway::new(inline_ack("ok"));
    gateway.delay = Duration::from_secs(5);
    let (service, mut rx) = service(Arc::new(gateway), Arc::new(RunTracker::new()));

    let err = service.send("main", "Hi", "k1").await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout(_)));
    assert!(err.is_retryable());
    assert!(matches!(&drain(&mut rx)[..], [PushEvent::Error { session_key, .. }] if session_key == "main"));
}

#[tokio::test]
async fn test_abort_is_forwarded() {
    let gateway = Arc::new(AckGateway::new(ChatSendResult::default()));
    let (service, _rx) = service(Arc::clone(&gateway), Arc::new(RunTracker::new()));

    service
        .handle(ClientRequest::Abort {
            session_key: "main".into(),
        })
        .await;
    assert_eq!(gateway.aborts.lock().unwrap().as_slice(), &["main".to_string()]);
}
