//! Sliding-window request log per client.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use tokio::time::Instant;

/// Tracks recent requests per client key and rejects bursts.
///
/// Process-scoped: build one at startup and share it through `Arc`.
#[derive(Debug)]
pub struct RateTracker {
    limit: usize,
    window: Duration,
    log: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateTracker {
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            log: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `client` if it is within the limit.
    ///
    /// Returns `false`, without recording, when the client already made
    /// `limit` requests inside the window.
    pub fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut log = self.log.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entries = log.entry(client.to_string()).or_default();
        while entries
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            entries.pop_front();
        }
        if entries.len() >= self.limit {
            return false;
        }
        entries.push_back(now);
        true
    }

    /// Drop clients with no request inside the window.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut log = self.log.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        log.retain(|_, entries| {
            entries
                .back()
                .is_some_and(|t| now.duration_since(*t) < self.window)
        });
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let tracker = RateTracker::new(2, Duration::from_secs(10));
        assert!(tracker.check("a"));
        assert!(tracker.check("a"));
        assert!(!tracker.check("a"));
        assert!(tracker.check("b"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(tracker.check("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_idle_clients() {
        let tracker = RateTracker::new(5, Duration::from_secs(1));
        tracker.check("a");
        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.check("b");

        tracker.prune();
        let log = tracker.log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.contains_key("b"));
    }
}
