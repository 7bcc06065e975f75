//! Raw frames emitted by the agent runtime.

use chat_sync_core::{Content, SessionKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `state` of a runtime chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Started,
    Delta,
    Final,
    Error,
    Aborted,
}

impl ChatState {
    /// Parse a raw state string. Unknown states yield `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "started" => Some(Self::Started),
            "delta" => Some(Self::Delta),
            "final" => Some(Self::Final),
            "error" => Some(Self::Error),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// A `chat` event: one step of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub session_key: SessionKey,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// An `agent` event: coarse activity for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    #[serde(default)]
    pub session_key: SessionKey,
    #[serde(default, alias = "state")]
    pub status: String,
}

/// A frame read from the runtime's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeFrame {
    Chat(ChatEvent),
    Agent(AgentEvent),
    /// Out-of-band notice such as a runtime restart.
    System(Value),
}

impl RuntimeFrame {
    /// Decode `{"event": "...", "payload": {...}}`.
    ///
    /// Returns `Ok(None)` for event kinds the bridge does not consume.
    ///
    /// # Errors
    /// Returns error if a recognized event carries a malformed payload.
    pub fn from_value(mut value: Value) -> Result<Option<Self>, serde_json::Error> {
        let payload = value
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        let kind = value.get("event").and_then(Value::as_str).unwrap_or_default();

        let frame = match kind {
            "chat" => Self::Chat(serde_json::from_value(payload)?),
            "agent" => Self::Agent(serde_json::from_value(payload)?),
            "system" => Self::System(payload),
            _ => return Ok(None),
        };
        Ok(Some(frame))
    }

    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns error if the text is not JSON or the payload is malformed.
    pub fn parse(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        Self::from_value(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_chat_frame() {
        let frame = RuntimeFrame::parse(
            r#"{"event":"chat","payload":{"state":"delta","runId":"r1","sessionKey":"main","content":"He","seq":2}}"#,
        )
        .unwrap()
        .unwrap();
        let RuntimeFrame::Chat(event) = frame else {
            panic!("expected chat frame");
        };
        assert_eq!(event.state.as_deref().and_then(ChatState::parse), Some(ChatState::Delta));
        assert_eq!(event.run_id.as_deref(), Some("r1"));
        assert_eq!(event.seq, Some(2));
    }

    #[test]
    fn test_agent_state_alias() {
        let frame = RuntimeFrame::from_value(
            json!({"event": "agent", "payload": {"sessionKey": "main", "state": "running"}}),
        )
        .unwrap();
        assert_eq!(
            frame,
            Some(RuntimeFrame::Agent(AgentEvent {
                session_key: "main".into(),
                status: "running".into(),
            }))
        );
    }

    #[test]
    fn test_unknown_event_is_skipped() {
        assert_eq!(RuntimeFrame::from_value(json!({"event": "presence"})).unwrap(), None);
        assert!(RuntimeFrame::from_value(json!({"event": "chat", "payload": 3})).is_err());
    }
}
