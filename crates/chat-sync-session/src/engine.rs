//! Client sync engine: merges the push and poll channels for one session.

use std::sync::Arc;

use chat_sync_core::{
    ClientRequest, Gateway, GatewayError, HistoryEntry, Message, PushEvent, RequestSink,
    SessionKey, SyncConfig, message::normalize_history,
};
use futures::{FutureExt, StreamExt, future::BoxFuture, stream::BoxStream};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};

use crate::{
    controller::SessionController,
    schedule::{Cadence, Schedule, Tick},
    state::{SessionState, SessionView},
};

/// Command channel depth between controller and engine.
const COMMAND_BUFFER: usize = 64;

/// Session used when the gateway cannot name a default.
const FALLBACK_SESSION: &str = "main";

/// Why a poll was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollReason {
    /// First load after start, switch or reset.
    Load,
    Cadence,
    /// Idle status while awaiting.
    Idle,
    /// Safety deadline passed.
    Safety,
    Manual,
}

/// Mutating requests from the controller.
pub(crate) enum Command {
    Send {
        text: String,
        idempotency_key: String,
        reply: oneshot::Sender<Message>,
    },
    Abort {
        reply: oneshot::Sender<Option<Message>>,
    },
    Switch {
        session_key: SessionKey,
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    DismissNotice,
    PollNow,
}

struct PollResult {
    generation: u64,
    reason: PollReason,
    /// Issued after an idle status, so it may settle the send.
    settles: bool,
    history: Result<Vec<HistoryEntry>, GatewayError>,
}

/// Builder and task state of the sync engine.
///
/// Each engine owns one session at a time. Every mutation arrives through
/// its [`SessionController`]; push events and poll results are merged on
/// the same task, so session state needs no lock.
pub struct SyncEngine {
    gateway: Arc<dyn Gateway>,
    config: SyncConfig,
    events: Option<BoxStream<'static, PushEvent>>,
    sink: Option<Arc<dyn RequestSink>>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(gateway: Arc<dyn Gateway>, config: SyncConfig) -> Self {
        Self {
            gateway,
            config,
            events: None,
            sink: None,
        }
    }

    /// Inbound push events. Without them the engine runs on polling alone.
    #[must_use]
    pub fn with_events(mut self, events: BoxStream<'static, PushEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Outbound requests to the bridge.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RequestSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start the engine on `session_key`, or on the gateway's default
    /// session when `None`.
    pub async fn spawn(
        self,
        session_key: Option<SessionKey>,
    ) -> (SessionController, tokio::task::JoinHandle<()>) {
        let session_key = match session_key {
            Some(key) => key,
            None => match self.gateway.default_session().await {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!("no default session from gateway, using {FALLBACK_SESSION}: {e}");
                    FALLBACK_SESSION.to_string()
                }
            },
        };

        let state = SessionState::new(session_key);
        let (view_tx, view_rx) = watch::channel(state.view());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let task = EngineTask {
            schedule: Schedule::new(
                self.config.fast_poll(),
                self.config.idle_poll(),
                self.config.safety_timeout(),
            ),
            state,
            gateway: Arc::clone(&self.gateway),
            events: self.events,
            sink: self.sink,
            commands: command_rx,
            view: view_tx,
            in_flight: None,
            repoll: None,
            generation: 0,
            config: self.config.clone(),
        };
        let handle = tokio::spawn(task.run());

        let controller = SessionController::new(command_tx, view_rx, self.gateway, self.config);
        (controller, handle)
    }
}

struct EngineTask {
    state: SessionState,
    schedule: Schedule,
    gateway: Arc<dyn Gateway>,
    events: Option<BoxStream<'static, PushEvent>>,
    sink: Option<Arc<dyn RequestSink>>,
    commands: mpsc::Receiver<Command>,
    view: watch::Sender<SessionView>,
    in_flight: Option<BoxFuture<'static, PollResult>>,
    /// Poll requested while another was in flight.
    repoll: Option<PollReason>,
    /// Bumped on switch/reset; results from older generations are dropped.
    generation: u64,
    config: SyncConfig,
}

impl EngineTask {
    async fn run(mut self) {
        tracing::info!(session_key = self.state.key(), "sync engine started");
        self.start_session();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_push(event),
                    None => {
                        tracing::info!("push channel closed, continuing on polling");
                        self.events = None;
                    }
                },
                result = poll_result(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.handle_poll_result(result);
                    if let Some(reason) = self.repoll.take() {
                        self.start_poll(reason);
                    }
                }
                tick = self.schedule.next() => self.handle_tick(tick),
            }
            self.publish();
        }

        self.schedule.cancel_all();
        tracing::info!(session_key = self.state.key(), "sync engine stopped");
    }

    /// Load the current session and settle into idle polling.
    fn start_session(&mut self) {
        self.start_poll(PollReason::Load);
        self.schedule.set_cadence(Cadence::Idle);
        self.publish();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                text,
                idempotency_key,
                reply,
            } => {
                let message = self.send(text, idempotency_key);
                let _ = reply.send(message);
            }
            Command::Abort { reply } => {
                let partial = self.abort();
                let _ = reply.send(partial);
            }
            Command::Switch { session_key, reply } => {
                self.switch(session_key);
                let _ = reply.send(());
            }
            Command::Reset { reply } => {
                let result = self.reset().await;
                let _ = reply.send(result);
            }
            Command::DismissNotice => {
                self.state.dismiss_notice();
                self.schedule.cancel_notice_expiry();
            }
            Command::PollNow => self.start_poll(PollReason::Manual),
        }
    }

    fn send(&mut self, text: String, idempotency_key: String) -> Message {
        let message = self.state.begin_send(&text);
        self.schedule.set_cadence(Cadence::Fast);
        self.schedule.arm_safety();

        let request = ClientRequest::Send {
            session_key: self.state.key().to_string(),
            message: text,
            idempotency_key,
        };
        let delivered = match &self.sink {
            Some(sink) => sink.send(request).map_err(|e| e.to_string()),
            None => Err("push channel unavailable".to_string()),
        };
        if let Err(e) = delivered {
            tracing::warn!(session_key = self.state.key(), "send not delivered: {e}");
            let expires_at = self.notice_deadline();
            self.state
                .fail_send(&format!("Message not delivered: {e}"), expires_at);
            self.after_activity_cleared();
            self.arm_notice();
        }
        message
    }

    fn abort(&mut self) -> Option<Message> {
        let session_key = self.state.key().to_string();
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.send(ClientRequest::Abort {
                session_key: session_key.clone(),
            }) {
                tracing::debug!(%session_key, "abort not delivered: {e}");
            }
        }
        let partial = self.state.abort();
        self.after_activity_cleared();
        partial
    }

    fn switch(&mut self, session_key: SessionKey) {
        tracing::info!(from = self.state.key(), to = %session_key, "switching session");
        self.teardown();
        self.state = SessionState::new(session_key);
        self.start_session();
    }

    async fn reset(&mut self) -> Result<(), GatewayError> {
        let session_key = self.state.key().to_string();
        self.teardown();
        self.state = SessionState::new(session_key.clone());

        let timeout = self.config.rpc_timeout();
        let result = match tokio::time::timeout(timeout, self.gateway.reset_session(&session_key)).await {
            Ok(res) => res,
            Err(_) => Err(GatewayError::Timeout(timeout)),
        };
        if let Err(e) = &result {
            tracing::warn!(%session_key, "reset failed: {e}");
        }
        self.start_session();
        result
    }

    /// Cancel every timer and any in-flight poll of the current session.
    fn teardown(&mut self) {
        self.schedule.cancel_all();
        self.in_flight = None;
        self.repoll = None;
        self.generation += 1;
    }

    fn handle_push(&mut self, event: PushEvent) {
        let was_awaiting = self.state.awaiting_response();
        let prior_notice = self.state.notice().map(|n| n.expires_at);
        let expires_at = self.notice_deadline();
        let outcome = self.state.apply_push(event, expires_at);
        if outcome.ignored {
            return;
        }
        if outcome.poll_now {
            self.start_poll(PollReason::Idle);
        }
        if was_awaiting && !self.state.awaiting_response() {
            self.after_activity_cleared();
        }
        if self.state.notice().map(|n| n.expires_at) != prior_notice {
            self.arm_notice();
        }
    }

    fn handle_tick(&mut self, tick: Tick) {
        match tick {
            Tick::Poll => {
                self.start_poll(PollReason::Cadence);
                self.schedule.rearm_poll();
            }
            Tick::Safety => {
                if self.state.awaiting_response() {
                    tracing::debug!(session_key = self.state.key(), "safety deadline passed, forcing poll");
                    self.start_poll(PollReason::Safety);
                    self.schedule.arm_safety();
                }
            }
            Tick::NoticeExpiry => {
                // A newer notice replaced the one this timer was armed for.
                if !self.state.expire_notice(Instant::now()) {
                    self.arm_notice();
                }
            }
        }
    }

    fn start_poll(&mut self, reason: PollReason) {
        if self.in_flight.is_some() {
            // The in-flight poll may predate what this one should observe.
            tracing::trace!(?reason, "poll already in flight");
            if reason != PollReason::Cadence && self.repoll.is_none() {
                self.repoll = Some(reason);
            }
            return;
        }
        let gateway = Arc::clone(&self.gateway);
        let session_key = self.state.key().to_string();
        let limit = self.config.history_limit;
        let timeout = self.config.rpc_timeout();
        let generation = self.generation;
        let settles = self.state.settle_pending();

        self.in_flight = Some(
            async move {
                let history = match tokio::time::timeout(timeout, gateway.get_history(&session_key, limit)).await {
                    Ok(res) => res,
                    Err(_) => Err(GatewayError::Timeout(timeout)),
                };
                PollResult {
                    generation,
                    reason,
                    settles,
                    history,
                }
            }
            .boxed(),
        );
    }

    fn handle_poll_result(&mut self, result: PollResult) {
        if result.generation != self.generation {
            return;
        }
        match result.history {
            Ok(entries) => {
                let was_awaiting = self.state.awaiting_response();
                let history = normalize_history(self.state.key(), entries);
                let changed = if result.settles {
                    self.state.apply_history(history)
                } else {
                    self.state.merge_history(history)
                };
                if changed {
                    tracing::debug!(session_key = self.state.key(), reason = ?result.reason, "transcript reconciled from history");
                }
                if was_awaiting && !self.state.awaiting_response() {
                    self.after_activity_cleared();
                }
            }
            Err(e) => {
                // Retried on the next tick.
                tracing::debug!(session_key = self.state.key(), reason = ?result.reason, "poll failed: {e}");
                let was_awaiting = self.state.awaiting_response();
                if result.settles {
                    self.state.apply_history_failure();
                }
                if was_awaiting && !self.state.awaiting_response() {
                    self.after_activity_cleared();
                }
            }
        }
    }

    /// Back to idle cadence once nothing is awaited.
    fn after_activity_cleared(&mut self) {
        self.schedule.cancel_safety();
        self.schedule.set_cadence(Cadence::Idle);
    }

    fn notice_deadline(&self) -> Instant {
        Instant::now() + self.config.notice_ttl()
    }

    fn arm_notice(&mut self) {
        if let Some(notice) = self.state.notice() {
            self.schedule.arm_notice_expiry(notice.expires_at);
        }
    }

    fn publish(&self) {
        let view = self.state.view();
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

async fn next_event(events: &mut Option<BoxStream<'static, PushEvent>>) -> Option<PushEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_result(in_flight: &mut Option<BoxFuture<'static, PollResult>>) -> PollResult {
    match in_flight {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}
