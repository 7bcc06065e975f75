//! Broadcast hub for push events.

use std::sync::Arc;

use futures::{StreamExt, future, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::event::PushEvent;

/// Default broadcast buffer, in events.
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of push events to every connected client.
///
/// Slow receivers that fall behind lose events rather than stall the
/// bridge; the poll path recovers anything they miss.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<PushEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Broadcast an event. Having no listeners is not an error.
    pub fn push(&self, event: PushEvent) {
        tracing::trace!(session_key = event.session_key(), "broadcast push event");
        let _ = self.sender.send(event);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.sender.subscribe()
    }

    /// Stream of every live event, skipping over lag gaps.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, PushEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move {
                match res {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::debug!("push receiver lagged: {e}");
                        None
                    }
                }
            })
            .boxed()
    }

    /// Stream of live events for one session.
    #[must_use]
    pub fn session_stream(&self, session_key: impl Into<String>) -> BoxStream<'static, PushEvent> {
        let session_key = session_key.into();
        self.stream()
            .filter(move |event| future::ready(event.session_key() == session_key))
            .boxed()
    }

    /// Forward a stream of events into this hub.
    pub fn spawn_forwarder<S, E>(self: Arc<Self>, stream: S) -> tokio::task::JoinHandle<()>
    where
        S: futures::Stream<Item = Result<PushEvent, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::pin!(stream);

            while let Some(next) = stream.next().await {
                match next {
                    Ok(event) => self.push(event),
                    Err(e) => tracing::warn!("push forwarder stream error: {e}"),
                }
            }
        })
    }
}
