//! Connection-loop tests for the gateway bridge.

use std::{collections::VecDeque, sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use chat_sync_bridge::{BridgeError, FrameStream, GatewayBridge, RuntimeConnector, RuntimeFrame};
use chat_sync_core::{EventHub, PushEvent, RunTracker, SyncConfig};
use futures::StreamExt;
use serde_json::json;

/// Hands out one scripted frame list per connect, then a stream that
/// never yields.
struct ScriptedConnector {
    connections: Mutex<VecDeque<Vec<RuntimeFrame>>>,
    connects: Mutex<usize>,
}

impl ScriptedConnector {
    fn new(connections: Vec<Vec<RuntimeFrame>>) -> Self {
        Self {
            connections: Mutex::new(connections.into()),
            connects: Mutex::new(0),
        }
    }
}

#[async_trait]
impl RuntimeConnector for ScriptedConnector {
    async fn connect(&self) -> Result<FrameStream, BridgeError> {
        *self.connects.lock().unwrap() += 1;
        match self.connections.lock().unwrap().pop_front() {
            Some(frames) => Ok(futures::stream::iter(frames.into_iter().map(Ok)).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Fails every connect attempt.
struct DownConnector {
    attempts: Mutex<usize>,
}

#[async_trait]
impl RuntimeConnector for DownConnector {
    async fn connect(&self) -> Result<FrameStream, BridgeError> {
        *self.attempts.lock().unwrap() += 1;
        Err(BridgeError::Connect("connection refused".into()))
    }
}

fn delta(run_id: &str, session_key: &str, text: &str) -> RuntimeFrame {
    RuntimeFrame::Chat(
        serde_json::from_value(json!({
            "state": "delta", "runId": run_id, "sessionKey": session_key, "content": text
        }))
        .unwrap(),
    )
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<PushEvent>) -> PushEvent {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("no event before timeout")
        .expect("hub closed")
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_clears_runs_and_rebroadcasts_idle() {
    let hub = Arc::new(EventHub::new());
    let runs = Arc::new(RunTracker::new());
    let mut rx = hub.subscribe();

    let connector = Arc::new(ScriptedConnector::new(vec![
        vec![delta("r1", "a", "Hel"), delta("r2", "b", "Wor")],
        Vec::new(),
    ]));
    let bridge = GatewayBridge::new(Arc::clone(&hub), Arc::clone(&runs));
    let (shutdown, handle) = bridge.spawn(Arc::clone(&connector), SyncConfig::default());

    assert!(matches!(next_event(&mut rx).await, PushEvent::Token { ref run_id, .. } if run_id == "r1"));
    assert!(matches!(next_event(&mut rx).await, PushEvent::Token { ref run_id, .. } if run_id == "r2"));

    // First stream ends without terminal events; the next connect clears both runs.
    assert_eq!(next_event(&mut rx).await, PushEvent::idle("a"));
    assert_eq!(next_event(&mut rx).await, PushEvent::idle("b"));
    assert!(runs.is_empty());

    drop(shutdown);
    handle.await.unwrap();
    assert!(*connector.connects.lock().unwrap() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failures_back_off_until_shutdown() {
    let hub = Arc::new(EventHub::new());
    let bridge = GatewayBridge::new(hub, Arc::new(RunTracker::new()));
    let connector = Arc::new(DownConnector {
        attempts: Mutex::new(0),
    });
    let config = SyncConfig {
        reconnect_min_ms: 100,
        reconnect_max_ms: 400,
        ..SyncConfig::default()
    };

    let (shutdown, handle) = bridge.spawn(Arc::clone(&connector), config);

    // Attempts at 0, 100, 300, 700, 1100 ms.
    tokio::time::sleep(Duration::from_millis(1_150)).await;
    assert_eq!(*connector.attempts.lock().unwrap(), 5);

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}
