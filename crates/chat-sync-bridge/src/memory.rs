//! In-memory agent runtime.
//!
//! Useful for development, tests and single-process demos. It serves the
//! gateway contract from memory and streams replies through the same
//! `chat`/`agent` frames a real runtime emits. Data is lost on restart.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chat_sync_core::{
    Content, Gateway, GatewayError, HistoryEntry, SessionKey,
    traits::{ChatSendResult, ConfigSnapshot, SessionSummary},
};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{
    bridge::{BridgeError, FrameStream, RuntimeConnector},
    runtime_event::{AgentEvent, ChatEvent, RuntimeFrame},
};

const RUN_LIVE: u8 = 0;
const RUN_ABORTED: u8 = 1;
/// Dropped without a terminal event, as on a runtime crash.
const RUN_LOST: u8 = 2;

/// How the runtime answers a `chat.send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Stream cumulative deltas, commit, then emit `final`.
    Streamed,
    /// Commit and return the answer in the RPC result; no events.
    Inline,
    /// Accept the message and never answer on its own.
    Held,
}

type Responder = Box<dyn Fn(&str) -> String + Send + Sync>;

struct Inner {
    sessions: RwLock<HashMap<SessionKey, Vec<HistoryEntry>>>,
    config: RwLock<(Value, u64)>,
    /// Acks by idempotency key.
    sends: Mutex<HashMap<String, ChatSendResult>>,
    runs: Mutex<HashMap<SessionKey, Arc<AtomicU8>>>,
    frames: broadcast::Sender<RuntimeFrame>,
    connections: Mutex<Vec<oneshot::Sender<()>>>,
    history_fetches: Mutex<Vec<SessionKey>>,
    history_available: RwLock<bool>,
    responder: Responder,
    mode: ReplyMode,
    step: Duration,
    history_latency: Duration,
    default_session: SessionKey,
}

/// In-memory gateway and runtime.
#[derive(Clone)]
pub struct MemoryGateway {
    inner: Arc<Inner>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl MemoryGateway {
    /// Echo runtime streaming word by word every 50 ms.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> MemoryGatewayBuilder {
        MemoryGatewayBuilder::default()
    }

    /// Append an entry to a session's history directly.
    pub fn push_history(&self, session_key: &str, entry: HistoryEntry) {
        self.inner.commit(session_key, entry);
    }

    /// Commit an assistant reply for a held send.
    pub fn commit_reply(&self, session_key: &str, text: &str) {
        self.inner.commit(
            session_key,
            HistoryEntry::new(format!("a-{}", Uuid::new_v4()), "assistant", text),
        );
    }

    /// Session keys of every `get_history` call so far.
    #[must_use]
    pub fn history_fetches(&self) -> Vec<SessionKey> {
        lock(&self.inner.history_fetches).clone()
    }

    /// Make `get_history` fail until re-enabled.
    pub fn set_history_available(&self, available: bool) {
        if let Ok(mut flag) = self.inner.history_available.write() {
            *flag = available;
        }
    }

    /// Simulate a runtime restart: in-flight runs vanish without a
    /// terminal event and a `system` notice goes out.
    pub fn restart(&self) {
        self.inner.drop_runs();
        self.inner
            .emit(RuntimeFrame::System(json!({"text": "runtime restarted"})));
    }

    /// Emit a raw frame to every connected bridge.
    pub fn emit(&self, frame: RuntimeFrame) {
        self.inner.emit(frame);
    }

    /// End every open event stream; connectors see a disconnect.
    pub fn disconnect_all(&self) {
        for stop in lock(&self.inner.connections).drain(..) {
            let _ = stop.send(());
        }
    }

    /// Runs currently generating.
    #[must_use]
    pub fn live_runs(&self) -> usize {
        lock(&self.inner.runs).len()
    }
}

/// Builder for [`MemoryGateway`].
pub struct MemoryGatewayBuilder {
    responder: Responder,
    mode: ReplyMode,
    step: Duration,
    history_latency: Duration,
    default_session: SessionKey,
}

impl Default for MemoryGatewayBuilder {
    fn default() -> Self {
        Self {
            responder: Box::new(|message| format!("You said: {message}")),
            mode: ReplyMode::Streamed,
            step: Duration::from_millis(50),
            history_latency: Duration::ZERO,
            default_session: "main".to_string(),
        }
    }
}

impl MemoryGatewayBuilder {
    #[must_use]
    pub fn responder(mut self, responder: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.responder = Box::new(responder);
        self
    }

    #[must_use]
    pub const fn mode(mut self, mode: ReplyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Delay between streamed deltas.
    #[must_use]
    pub const fn step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Delay before `get_history` answers. The answer reflects history
    /// as it was when the call started.
    #[must_use]
    pub const fn history_latency(mut self, latency: Duration) -> Self {
        self.history_latency = latency;
        self
    }

    #[must_use]
    pub fn default_session(mut self, session_key: impl Into<SessionKey>) -> Self {
        self.default_session = session_key.into();
        self
    }

    #[must_use]
    pub fn build(self) -> MemoryGateway {
        let (frames, _) = broadcast::channel(1024);
        MemoryGateway {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                config: RwLock::new((json!({}), 1)),
                sends: Mutex::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
                frames,
                connections: Mutex::new(Vec::new()),
                history_fetches: Mutex::new(Vec::new()),
                history_available: RwLock::new(true),
                responder: self.responder,
                mode: self.mode,
                step: self.step,
                history_latency: self.history_latency,
                default_session: self.default_session,
            }),
        }
    }
}

impl Inner {
    fn commit(&self, session_key: &str, entry: HistoryEntry) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.entry(session_key.to_string()).or_default().push(entry);
        }
    }

    fn emit(&self, frame: RuntimeFrame) {
        let _ = self.frames.send(frame);
    }

    fn emit_chat(&self, session_key: &str, run_id: &str, state: &str, content: Option<&str>, seq: Option<u64>) {
        self.emit(RuntimeFrame::Chat(ChatEvent {
            state: Some(state.to_string()),
            run_id: Some(run_id.to_string()),
            session_key: session_key.to_string(),
            content: content.map(Content::from),
            seq,
            error_message: None,
        }));
    }

    fn emit_agent(&self, session_key: &str, status: &str) {
        self.emit(RuntimeFrame::Agent(AgentEvent {
            session_key: session_key.to_string(),
            status: status.to_string(),
        }));
    }

    fn drop_runs(&self) {
        for (_, flag) in lock(&self.runs).drain() {
            flag.store(RUN_LOST, Ordering::SeqCst);
        }
    }

    async fn stream_reply(self: Arc<Self>, session_key: String, run_id: String, reply: String, flag: Arc<AtomicU8>) {
        self.emit_agent(&session_key, "running");
        let words: Vec<&str> = reply.split_inclusive(' ').collect();
        let mut partial = String::new();

        for (seq, word) in words.iter().enumerate() {
            tokio::time::sleep(self.step).await;
            match flag.load(Ordering::SeqCst) {
                RUN_ABORTED => {
                    self.emit_chat(&session_key, &run_id, "aborted", None, None);
                    self.emit_agent(&session_key, "idle");
                    return;
                }
                RUN_LOST => return,
                _ => {}
            }
            partial.push_str(word);
            self.emit_chat(&session_key, &run_id, "delta", Some(partial.trim_end()), Some(seq as u64));
        }

        tokio::time::sleep(self.step).await;
        if flag.load(Ordering::SeqCst) != RUN_LIVE {
            return;
        }
        self.commit(
            &session_key,
            HistoryEntry::new(format!("a-{}", Uuid::new_v4()), "assistant", reply.as_str()),
        );
        self.finish_run(&session_key, &flag);
        self.emit_chat(&session_key, &run_id, "final", Some(&reply), None);
        self.emit_agent(&session_key, "idle");
    }

    fn finish_run(&self, session_key: &str, flag: &Arc<AtomicU8>) {
        let mut runs = lock(&self.runs);
        if runs.get(session_key).is_some_and(|f| Arc::ptr_eq(f, flag)) {
            runs.remove(session_key);
        }
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn get_history(
        &self,
        session_key: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, GatewayError> {
        lock(&self.inner.history_fetches).push(session_key.to_string());
        let available = self
            .inner
            .history_available
            .read()
            .map(|flag| *flag)
            .unwrap_or(true);
        if !available {
            return Err(GatewayError::Unavailable("history offline".into()));
        }

        let history = {
            let sessions = self
                .inner
                .sessions
                .read()
                .map_err(|e| GatewayError::Rpc(e.to_string()))?;
            let history = sessions.get(session_key).map(Vec::as_slice).unwrap_or_default();
            let skip = history.len().saturating_sub(limit);
            history[skip..].to_vec()
        };
        if !self.inner.history_latency.is_zero() {
            tokio::time::sleep(self.inner.history_latency).await;
        }
        Ok(history)
    }

    async fn reset_session(&self, session_key: &str) -> Result<(), GatewayError> {
        self.inner
            .sessions
            .write()
            .map_err(|e| GatewayError::Rpc(e.to_string()))?
            .remove(session_key);
        Ok(())
    }

    async fn default_session(&self) -> Result<SessionKey, GatewayError> {
        Ok(self.inner.default_session.clone())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError> {
        let sessions = self
            .inner
            .sessions
            .read()
            .map_err(|e| GatewayError::Rpc(e.to_string()))?;

        let mut result: Vec<SessionSummary> = sessions
            .iter()
            .map(|(key, history)| SessionSummary {
                key: key.clone(),
                title: history
                    .iter()
                    .find(|e| e.role == "user")
                    .and_then(|e| e.content.as_ref())
                    .map(Content::extract_text),
                updated_at: history.last().and_then(|e| e.timestamp),
            })
            .collect();

        // Most recently updated first
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.key.cmp(&b.key)));
        Ok(result)
    }

    async fn get_config(&self) -> Result<ConfigSnapshot, GatewayError> {
        let config = self
            .inner
            .config
            .read()
            .map_err(|e| GatewayError::Rpc(e.to_string()))?;
        Ok(ConfigSnapshot {
            config: config.0.clone(),
            hash: config_hash(config.1),
        })
    }

    async fn patch_config(
        &self,
        patch: &Value,
        base_hash: &str,
    ) -> Result<ConfigSnapshot, GatewayError> {
        let mut config = self
            .inner
            .config
            .write()
            .map_err(|e| GatewayError::Rpc(e.to_string()))?;
        if base_hash != config_hash(config.1) {
            return Err(GatewayError::Conflict {
                base_hash: base_hash.to_string(),
            });
        }
        json_patch::merge(&mut config.0, patch);
        config.1 += 1;
        Ok(ConfigSnapshot {
            config: config.0.clone(),
            hash: config_hash(config.1),
        })
    }

    async fn send_chat(
        &self,
        session_key: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<ChatSendResult, GatewayError> {
        if let Some(ack) = lock(&self.inner.sends).get(idempotency_key) {
            tracing::debug!(%idempotency_key, "duplicate chat.send, returning first ack");
            return Ok(ack.clone());
        }

        let run_id = format!("run-{}", Uuid::new_v4());
        self.inner.commit(
            session_key,
            HistoryEntry::new(format!("u-{}", Uuid::new_v4()), "user", message),
        );
        let reply = (self.inner.responder)(message);

        let ack = match self.inner.mode {
            ReplyMode::Streamed => {
                let flag = Arc::new(AtomicU8::new(RUN_LIVE));
                lock(&self.inner.runs).insert(session_key.to_string(), Arc::clone(&flag));
                tokio::spawn(Arc::clone(&self.inner).stream_reply(
                    session_key.to_string(),
                    run_id.clone(),
                    reply,
                    flag,
                ));
                ChatSendResult {
                    run_id: Some(run_id),
                    status: Some("started".into()),
                    content: None,
                }
            }
            ReplyMode::Inline => {
                self.commit_reply(session_key, &reply);
                ChatSendResult {
                    run_id: Some(run_id),
                    status: Some("ok".into()),
                    content: Some(Content::Text(reply)),
                }
            }
            ReplyMode::Held => ChatSendResult {
                run_id: Some(run_id),
                status: Some("started".into()),
                content: None,
            },
        };

        lock(&self.inner.sends).insert(idempotency_key.to_string(), ack.clone());
        Ok(ack)
    }

    async fn abort_chat(&self, session_key: &str) -> Result<(), GatewayError> {
        if let Some(flag) = lock(&self.inner.runs).remove(session_key) {
            flag.store(RUN_ABORTED, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeConnector for MemoryGateway {
    async fn connect(&self) -> Result<FrameStream, BridgeError> {
        let (stop_tx, stop_rx) = oneshot::channel();
        lock(&self.inner.connections).push(stop_tx);

        let frames = BroadcastStream::new(self.inner.frames.subscribe())
            .filter_map(|res| async move { res.ok().map(Ok::<_, BridgeError>) })
            .take_until(stop_rx)
            .boxed();
        Ok(frames)
    }
}

fn config_hash(version: u64) -> String {
    format!("cfg-{version:08x}")
}
