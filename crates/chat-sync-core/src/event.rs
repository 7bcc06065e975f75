//! Push-channel protocol shared by the bridge and the client engine.

use serde::{Deserialize, Serialize};

use crate::message::{Message, SessionKey};

/// Coarse agent activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Thinking,
    Idle,
}

/// Event broadcast from the bridge to every connected client.
///
/// Events are not filtered per session on the way out; receivers discard
/// anything whose `session_key` is not their active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PushEvent {
    /// Cumulative streaming text for a run.
    Token {
        token: String,
        run_id: String,
        session_key: SessionKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    /// Activity change.
    Status {
        status: AgentStatus,
        session_key: SessionKey,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        aborted: bool,
    },
    /// Terminal assistant message.
    Message(Message),
    /// Runtime or delivery error.
    Error { error: String, session_key: SessionKey },
}

impl PushEvent {
    #[must_use]
    pub fn idle(session_key: impl Into<SessionKey>) -> Self {
        Self::Status {
            status: AgentStatus::Idle,
            session_key: session_key.into(),
            aborted: false,
        }
    }

    #[must_use]
    pub fn thinking(session_key: impl Into<SessionKey>) -> Self {
        Self::Status {
            status: AgentStatus::Thinking,
            session_key: session_key.into(),
            aborted: false,
        }
    }

    #[must_use]
    pub fn error(session_key: impl Into<SessionKey>, error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            session_key: session_key.into(),
        }
    }

    /// Session the event belongs to.
    #[must_use]
    pub fn session_key(&self) -> &str {
        match self {
            Self::Token { session_key, .. }
            | Self::Status { session_key, .. }
            | Self::Error { session_key, .. } => session_key,
            Self::Message(message) => &message.session_key,
        }
    }
}

/// Request from a client to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    /// Fire-and-forget chat send, deduplicated upstream by `idempotency_key`.
    Send {
        session_key: SessionKey,
        message: String,
        idempotency_key: String,
    },
    /// Best-effort abort of the session's in-flight run.
    Abort { session_key: SessionKey },
}

impl ClientRequest {
    #[must_use]
    pub fn session_key(&self) -> &str {
        match self {
            Self::Send { session_key, .. } | Self::Abort { session_key } => session_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::Role;

    #[test]
    fn test_token_wire_shape() {
        let event = PushEvent::Token {
            token: "He".into(),
            run_id: "r1".into(),
            session_key: "main".into(),
            seq: Some(2),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "token", "token": "He", "runId": "r1", "sessionKey": "main", "seq": 2})
        );
    }

    #[test]
    fn test_status_aborted_flag_only_when_set() {
        let idle = serde_json::to_value(PushEvent::idle("main")).unwrap();
        assert_eq!(idle, json!({"type": "status", "status": "idle", "sessionKey": "main"}));

        let parsed: PushEvent = serde_json::from_value(
            json!({"type": "status", "status": "idle", "sessionKey": "main", "aborted": true}),
        )
        .unwrap();
        assert!(matches!(parsed, PushEvent::Status { aborted: true, .. }));
    }

    #[test]
    fn test_message_event_is_flat() {
        let mut message = Message::new("r1", Role::Assistant, "Hi", "main");
        message.timestamp = 10;
        let value = serde_json::to_value(PushEvent::Message(message)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "message", "id": "r1", "role": "assistant",
                "content": "Hi", "timestamp": 10, "sessionKey": "main"
            })
        );
    }

    #[test]
    fn test_client_request_parse() {
        let request: ClientRequest = serde_json::from_value(json!({
            "type": "send", "sessionKey": "main", "message": "Hello", "idempotencyKey": "k1"
        }))
        .unwrap();
        assert_eq!(request.session_key(), "main");
    }
}
