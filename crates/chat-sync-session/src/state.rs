//! Per-session transcript state and its reconciliation rules.
//!
//! Everything here is synchronous; timers and I/O live in the engine.

use std::collections::{HashSet, VecDeque};

use chat_sync_core::{AgentStatus, Message, PushEvent, Role, SessionKey};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

/// Suffix appended to a partial answer the user aborted.
pub const ABORTED_MARKER: &str = "\n\n[aborted]";

const ABORTED_ID_PREFIX: &str = "aborted-";

/// Aborted run ids remembered for dropping their late tokens.
const ABORTED_RUNS_KEPT: usize = 16;

/// User-visible error that expires on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub text: String,
    pub expires_at: Instant,
}

/// What a push event did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushOutcome {
    /// An out-of-cycle poll should run now.
    pub poll_now: bool,
    /// A message was appended.
    pub appended: bool,
    /// The event belonged to another session.
    pub ignored: bool,
}

/// Read-only view of a session, published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_key: SessionKey,
    pub messages: Vec<Message>,
    pub streaming_text: String,
    pub awaiting_response: bool,
    pub is_thinking: bool,
    pub is_streaming: bool,
    pub notice: Option<String>,
}

/// Transcript and transient flags for one session.
#[derive(Debug)]
pub struct SessionState {
    key: SessionKey,
    messages: Vec<Message>,
    known_ids: HashSet<String>,
    stream_buffer: String,
    awaiting_response: bool,
    is_thinking: bool,
    is_streaming: bool,
    /// Run whose tokens are being shown.
    active_run: Option<String>,
    /// Runs aborted locally; their late tokens are dropped.
    aborted_runs: VecDeque<String>,
    /// Optimistic message of the send in progress.
    pending_send: Option<String>,
    /// An idle status arrived while awaiting; the next poll settles the send.
    settle_on_poll: bool,
    notice: Option<Notice>,
}

impl SessionState {
    #[must_use]
    pub fn new(key: impl Into<SessionKey>) -> Self {
        Self {
            key: key.into(),
            messages: Vec::new(),
            known_ids: HashSet::new(),
            stream_buffer: String::new(),
            awaiting_response: false,
            is_thinking: false,
            is_streaming: false,
            active_run: None,
            aborted_runs: VecDeque::new(),
            pending_send: None,
            settle_on_poll: false,
            notice: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn stream_buffer(&self) -> &str {
        &self.stream_buffer
    }

    #[must_use]
    pub const fn awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    #[must_use]
    pub const fn is_thinking(&self) -> bool {
        self.is_thinking
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    #[must_use]
    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    /// Append an optimistic user message and start awaiting a reply.
    pub fn begin_send(&mut self, text: &str) -> Message {
        let message = Message::optimistic_user(text, self.key.clone());
        self.known_ids.insert(message.id.clone());
        self.messages.push(message.clone());
        self.stream_buffer.clear();
        self.is_streaming = false;
        self.active_run = None;
        self.settle_on_poll = false;
        self.pending_send = Some(message.id.clone());
        self.awaiting_response = true;
        message
    }

    /// The send could not be delivered; keep the message, flag it failed.
    pub fn fail_send(&mut self, error: &str, expires_at: Instant) {
        if let Some(id) = self.pending_send.take() {
            self.mark_failed(&id);
        }
        self.clear_activity();
        self.show_notice(error, expires_at);
    }

    /// Apply a push event. Events for other sessions are ignored.
    pub fn apply_push(&mut self, event: PushEvent, notice_expires_at: Instant) -> PushOutcome {
        if event.session_key() != self.key {
            return PushOutcome {
                ignored: true,
                ..PushOutcome::default()
            };
        }

        let mut outcome = PushOutcome::default();
        match event {
            PushEvent::Token { token, run_id, .. } => {
                if self.aborted_runs.contains(&run_id) {
                    return outcome;
                }
                // Token payloads are cumulative.
                self.stream_buffer = token;
                self.is_streaming = true;
                self.is_thinking = false;
                self.active_run = Some(run_id);
                // The runtime picked the send up.
                self.pending_send = None;
            }
            PushEvent::Status {
                status: AgentStatus::Thinking,
                ..
            } => {
                self.stream_buffer.clear();
                self.is_thinking = true;
            }
            PushEvent::Status {
                status: AgentStatus::Idle,
                ..
            } => {
                self.is_thinking = false;
                self.is_streaming = false;
                self.stream_buffer.clear();
                if self.awaiting_response {
                    // The terminal message may be racing in through history.
                    self.settle_on_poll = true;
                    outcome.poll_now = true;
                }
            }
            PushEvent::Message(message) => {
                outcome.appended = self.append_terminal(message);
                self.clear_activity();
            }
            PushEvent::Error { error, .. } => {
                if let Some(id) = self.pending_send.take() {
                    self.mark_failed(&id);
                }
                self.clear_activity();
                self.show_notice(&error, notice_expires_at);
            }
        }
        outcome
    }

    /// Two-stage dedup: by id, then by content against the last message.
    fn append_terminal(&mut self, message: Message) -> bool {
        if self.known_ids.contains(&message.id) {
            tracing::debug!(id = %message.id, "dropping terminal message with known id");
            return false;
        }
        let duplicate_content = self
            .messages
            .last()
            .is_some_and(|last| last.role == Role::Assistant && last.content == message.content);
        if duplicate_content {
            tracing::debug!(id = %message.id, "dropping terminal message already delivered by poll");
            return false;
        }
        self.known_ids.insert(message.id.clone());
        self.messages.push(message);
        true
    }

    /// Reconcile against normalized history from a poll, then settle a
    /// send an idle status left waiting on it.
    ///
    /// History is authoritative: when it holds an unknown id or more
    /// assistant messages than the local transcript, local messages are
    /// replaced wholesale. Returns whether anything changed.
    pub fn apply_history(&mut self, history: Vec<Message>) -> bool {
        let changed = self.merge_history(history);
        if self.settle_on_poll {
            self.clear_activity();
        }
        changed
    }

    /// Like [`apply_history`](Self::apply_history) but never settles; for
    /// polls issued before the idle status arrived.
    pub fn merge_history(&mut self, history: Vec<Message>) -> bool {
        let has_new_messages = history.iter().any(|m| !self.known_ids.contains(&m.id));
        let remote_assistants = count_assistants(&history);
        let local_assistants = count_assistants(&self.messages);
        let assistant_grew = remote_assistants > local_assistants;

        if !(has_new_messages || assistant_grew) {
            return false;
        }

        // Only user messages this history carries for the first time can
        // be the commit of a local one.
        let committed: Vec<String> = history
            .iter()
            .filter(|m| m.role == Role::User && !self.known_ids.contains(&m.id))
            .map(|m| m.content.clone())
            .collect();
        let is_committed = |message: &Message| committed.contains(&message.content);

        let partials = self.unsuperseded_partials(&history);
        let failed: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.failed && !is_committed(*m))
            .cloned()
            .collect();
        let pending = self.pending_message();

        self.known_ids = history.iter().map(|m| m.id.clone()).collect();
        self.messages = history;
        for message in partials.into_iter().chain(failed) {
            self.known_ids.insert(message.id.clone());
            self.messages.push(message);
        }
        // Optimistic messages the runtime has not committed yet stay
        // visible until a later poll carries them.
        if let Some(pending) = pending {
            if is_committed(&pending) {
                self.pending_send = None;
            } else {
                self.known_ids.insert(pending.id.clone());
                self.messages.push(pending);
            }
        }

        if self.awaiting_response && assistant_grew {
            self.clear_activity();
        }
        true
    }

    /// A poll failed. An idle-triggered settle still completes: the
    /// runtime reported idle, and later polls pick up any late answer.
    pub fn apply_history_failure(&mut self) {
        if self.settle_on_poll {
            self.clear_activity();
        }
    }

    /// An idle status is waiting on the next poll to settle the send.
    #[must_use]
    pub const fn settle_pending(&self) -> bool {
        self.settle_on_poll
    }

    /// Stop consuming the current run and repair the transcript.
    ///
    /// Returns the synthesized partial answer, if any text had streamed.
    pub fn abort(&mut self) -> Option<Message> {
        if let Some(run_id) = self.active_run.take() {
            if self.aborted_runs.len() == ABORTED_RUNS_KEPT {
                self.aborted_runs.pop_front();
            }
            self.aborted_runs.push_back(run_id);
        }
        let partial = (!self.stream_buffer.is_empty()).then(|| {
            let message = Message::new(
                format!("{ABORTED_ID_PREFIX}{}", Uuid::new_v4()),
                Role::Assistant,
                format!("{}{ABORTED_MARKER}", self.stream_buffer),
                self.key.clone(),
            );
            self.known_ids.insert(message.id.clone());
            self.messages.push(message.clone());
            message
        });
        self.clear_activity();
        partial
    }

    pub fn dismiss_notice(&mut self) {
        self.notice = None;
    }

    /// Drop the notice if it has expired. Returns whether it was dropped.
    pub fn expire_notice(&mut self, now: Instant) -> bool {
        if self.notice.as_ref().is_some_and(|n| n.expires_at <= now) {
            self.notice = None;
            return true;
        }
        false
    }

    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView {
            session_key: self.key.clone(),
            messages: self.messages.clone(),
            streaming_text: self.stream_buffer.clone(),
            awaiting_response: self.awaiting_response,
            is_thinking: self.is_thinking,
            is_streaming: self.is_streaming,
            notice: self.notice.as_ref().map(|n| n.text.clone()),
        }
    }

    /// Locally synthesized partial answers that history has not replaced
    /// with a committed answer of its own.
    fn unsuperseded_partials(&self, history: &[Message]) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.id.starts_with(ABORTED_ID_PREFIX))
            .filter(|m| {
                let partial = m.content.trim_end_matches(ABORTED_MARKER);
                !history
                    .iter()
                    .any(|h| h.is_assistant() && h.content.starts_with(partial))
            })
            .cloned()
            .collect()
    }

    fn pending_message(&self) -> Option<Message> {
        let id = self.pending_send.as_ref()?;
        self.messages.iter().find(|m| &m.id == id).cloned()
    }

    fn mark_failed(&mut self, id: &str) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.failed = true;
        }
    }

    fn show_notice(&mut self, text: &str, expires_at: Instant) {
        self.notice = Some(Notice {
            text: text.to_string(),
            expires_at,
        });
    }

    fn clear_activity(&mut self) {
        self.awaiting_response = false;
        self.is_thinking = false;
        self.is_streaming = false;
        self.stream_buffer.clear();
        self.active_run = None;
        self.pending_send = None;
        self.settle_on_poll = false;
    }
}

fn count_assistants(messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.is_assistant()).count()
}
