//! Transcript messages and runtime history entries.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::Content;

/// Opaque conversation identifier.
pub type SessionKey = String;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Parse a runtime role string. Tool roles and unknown roles yield `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" | "human" => Some(Self::User),
            "assistant" | "ai" | "model" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// A normalized transcript message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub session_key: SessionKey,
    /// Set on an optimistic user message whose delivery failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

impl Message {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        session_key: impl Into<SessionKey>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: now_millis(),
            session_key: session_key.into(),
            failed: false,
        }
    }

    /// Optimistic user message with a client-synthesized id.
    #[must_use]
    pub fn optimistic_user(content: impl Into<String>, session_key: impl Into<SessionKey>) -> Self {
        Self::new(format!("local-{}", Uuid::new_v4()), Role::User, content, session_key)
    }

    #[must_use]
    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// One entry of the runtime's committed history, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl HistoryEntry {
    #[must_use]
    pub fn new(id: impl Into<String>, role: impl Into<String>, content: impl Into<Content>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            content: Some(content.into()),
            timestamp: Some(now_millis()),
        }
    }
}

/// Normalize raw history into display messages.
///
/// Tool calls, tool results and entries without display text are dropped;
/// order is preserved.
#[must_use]
pub fn normalize_history(session_key: &str, entries: Vec<HistoryEntry>) -> Vec<Message> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let role = Role::parse(&entry.role)?;
            let content = entry.content.as_ref()?;
            if content.is_tool_traffic() {
                return None;
            }
            let text = content.extract_text();
            if text.is_empty() {
                return None;
            }
            Some(Message {
                id: entry.id,
                role,
                content: text,
                timestamp: entry.timestamp.unwrap_or(0),
                session_key: session_key.to_string(),
                failed: false,
            })
        })
        .collect()
}

/// Current Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_normalize_drops_tool_and_empty_entries() {
        let entries: Vec<HistoryEntry> = serde_json::from_value(json!([
            {"id": "1", "role": "user", "content": "Hello"},
            {"id": "2", "role": "assistant", "content": [{"type": "tool_use", "name": "lookup"}]},
            {"id": "3", "role": "toolResult", "content": "raw tool output"},
            {"id": "4", "role": "assistant", "content": [{"type": "text", "text": "   "}]},
            {"id": "5", "role": "assistant", "content": {"text": "Hello there!"}, "timestamp": 7},
            {"id": "6", "role": "assistant"}
        ]))
        .unwrap();

        let messages = normalize_history("s1", entries);
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["1", "5"]);
        assert_eq!(messages[1].content, "Hello there!");
        assert_eq!(messages[1].timestamp, 7);
        assert_eq!(messages[1].session_key, "s1");
    }

    #[test]
    fn test_optimistic_ids_are_unique() {
        let a = Message::optimistic_user("hi", "s");
        let b = Message::optimistic_user("hi", "s");
        assert_ne!(a.id, b.id);
        assert_eq!(a.role, Role::User);
    }

    #[test]
    fn test_now_millis_is_epoch_millis() {
        let expected = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
        let now = i128::from(now_millis());
        assert!((now - i128::try_from(expected).unwrap()).abs() < 1_000, "{now}");
    }
}
