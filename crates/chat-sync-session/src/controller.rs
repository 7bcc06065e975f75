//! Session controller: the only mutating entry point into a sync engine.

use std::{sync::Arc, time::Duration};

use chat_sync_core::{
    Gateway, GatewayError, Message, SessionKey, SyncConfig, patch_config_with_retry,
    traits::{ConfigSnapshot, SessionSummary},
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::{engine::Command, state::SessionView};

/// Controller error.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Sync engine stopped")]
    EngineStopped,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Handle to a running sync engine.
///
/// Cheap to clone; all clones drive the same engine. The engine stops
/// once every clone is dropped.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<SessionView>,
    gateway: Arc<dyn Gateway>,
    config: SyncConfig,
}

impl SessionController {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        view: watch::Receiver<SessionView>,
        gateway: Arc<dyn Gateway>,
        config: SyncConfig,
    ) -> Self {
        Self {
            commands,
            view,
            gateway,
            config,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ControllerError::EngineStopped)?;
        rx.await.map_err(|_| ControllerError::EngineStopped)
    }

    /// Send a user message under a fresh idempotency key.
    ///
    /// Returns the optimistic message as soon as it is in the transcript;
    /// the reply arrives later through the view.
    pub async fn send(&self, text: impl Into<String>) -> Result<Message, ControllerError> {
        let text = text.into();
        let idempotency_key = Uuid::new_v4().to_string();
        tracing::debug!(%idempotency_key, "sending message");
        self.request(|reply| Command::Send {
            text,
            idempotency_key,
            reply,
        })
        .await
    }

    /// Abort the in-flight reply. Returns the partial answer kept in the
    /// transcript, if any text had streamed.
    pub async fn abort(&self) -> Result<Option<Message>, ControllerError> {
        self.request(|reply| Command::Abort { reply }).await
    }

    /// Drop all state of the current session and load `session_key`.
    pub async fn switch_session(&self, session_key: impl Into<SessionKey>) -> Result<(), ControllerError> {
        let session_key = session_key.into();
        self.request(|reply| Command::Switch { session_key, reply })
            .await
    }

    /// Clear the current session locally and in the runtime's history.
    pub async fn reset_session(&self) -> Result<(), ControllerError> {
        self.request(|reply| Command::Reset { reply }).await??;
        Ok(())
    }

    pub async fn dismiss_notice(&self) -> Result<(), ControllerError> {
        self.commands
            .send(Command::DismissNotice)
            .await
            .map_err(|_| ControllerError::EngineStopped)
    }

    /// Poll history now instead of at the next tick.
    pub async fn refresh(&self) -> Result<(), ControllerError> {
        self.commands
            .send(Command::PollNow)
            .await
            .map_err(|_| ControllerError::EngineStopped)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ControllerError> {
        Ok(self.gateway.list_sessions().await?)
    }

    /// Patch runtime config, re-reading on a stale hash up to the
    /// configured number of attempts.
    pub async fn patch_config(&self, patch: &Value) -> Result<ConfigSnapshot, ControllerError> {
        Ok(patch_config_with_retry(
            self.gateway.as_ref(),
            patch,
            self.config.config_patch_attempts,
        )
        .await?)
    }

    /// Current view of the session.
    #[must_use]
    pub fn snapshot(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Wait until the view satisfies `predicate`.
    ///
    /// # Errors
    /// [`ControllerError::Timeout`] if it does not within `within`.
    pub async fn wait_until<F>(&self, within: Duration, mut predicate: F) -> Result<SessionView, ControllerError>
    where
        F: FnMut(&SessionView) -> bool,
    {
        let mut view = self.view.clone();
        match tokio::time::timeout(within, view.wait_for(|v| predicate(v))).await {
            Ok(Ok(current)) => Ok(current.clone()),
            Ok(Err(_)) => Err(ControllerError::EngineStopped),
            Err(_) => Err(ControllerError::Timeout(within)),
        }
    }
}
