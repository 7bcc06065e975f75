//! Wire protocol for the browser push channel.

use chat_sync_core::{ClientRequest, PushEvent, SessionKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start a run. Fire-and-forget; the reply arrives as push events.
    Send {
        session_key: SessionKey,
        message: String,
        /// Generated server-side when absent.
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    Abort { session_key: SessionKey },
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// The bridge request this message carries, if any.
    #[must_use]
    pub fn into_request(self) -> Option<ClientRequest> {
        match self {
            Self::Send {
                session_key,
                message,
                idempotency_key,
            } => Some(ClientRequest::Send {
                session_key,
                message,
                idempotency_key: idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string()),
            }),
            Self::Abort { session_key } => Some(ClientRequest::Abort { session_key }),
            Self::Ping => None,
        }
    }
}

/// Connection-level replies that are not session events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    Pong,
    /// The client frame could not be decoded.
    Invalid { message: String },
}

/// Message from server to client: a push event or a control reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(PushEvent),
    Control(Control),
}

impl From<PushEvent> for ServerMessage {
    fn from(event: PushEvent) -> Self {
        Self::Event(event)
    }
}

impl From<Control> for ServerMessage {
    fn from(control: Control) -> Self {
        Self::Control(control)
    }
}
