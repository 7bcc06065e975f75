//! Contracts for the agent-runtime gateway and the outbound push channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    content::Content,
    event::ClientRequest,
    message::{HistoryEntry, SessionKey},
};

/// Gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
    #[error("Gateway request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Config hash is stale (base {base_hash})")]
    Conflict { base_hash: String },
    #[error("Session not found: {0}")]
    NotFound(SessionKey),
    #[error("Gateway RPC error: {0}")]
    Rpc(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::Conflict { .. }
        )
    }
}

/// Summary row from `list_sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub key: SessionKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// Runtime config plus the hash that guards writes to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub config: Value,
    pub hash: String,
}

/// Acknowledgement of a `chat.send` RPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendResult {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Inline answer, for runtimes that reply in the RPC result.
    #[serde(default)]
    pub content: Option<Content>,
}

impl ChatSendResult {
    /// The runtime reports the run as accepted and still generating.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("started" | "in_flight" | "in-flight")
        )
    }
}

/// Request/response contract of the agent-runtime gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Committed history for a session, oldest first.
    async fn get_history(
        &self,
        session_key: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, GatewayError>;

    /// Clear the persisted history of a session.
    async fn reset_session(&self, session_key: &str) -> Result<(), GatewayError>;

    /// Key of the runtime's default session.
    async fn default_session(&self) -> Result<SessionKey, GatewayError>;

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError>;

    async fn get_config(&self) -> Result<ConfigSnapshot, GatewayError>;

    /// Apply `patch` if `base_hash` is still current; otherwise
    /// [`GatewayError::Conflict`].
    async fn patch_config(
        &self,
        patch: &Value,
        base_hash: &str,
    ) -> Result<ConfigSnapshot, GatewayError>;

    /// Start a run. The same `idempotency_key` delivered twice is one run.
    async fn send_chat(
        &self,
        session_key: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<ChatSendResult, GatewayError>;

    async fn abort_chat(&self, session_key: &str) -> Result<(), GatewayError>;
}

/// Transport error on the outbound push channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Push channel unavailable: {0}")]
    Unavailable(String),
}

/// Outbound half of the push channel, client to bridge.
pub trait RequestSink: Send + Sync {
    /// Queue a request without waiting for any reply.
    fn send(&self, request: ClientRequest) -> Result<(), TransportError>;
}

impl RequestSink for mpsc::UnboundedSender<ClientRequest> {
    fn send(&self, request: ClientRequest) -> Result<(), TransportError> {
        Self::send(self, request).map_err(|_| TransportError::ChannelClosed)
    }
}
