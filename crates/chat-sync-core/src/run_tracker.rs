//! Server-side registry of in-flight runs.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};

use crate::message::SessionKey;

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Started,
    Streaming,
    Final,
    Error,
    Aborted,
}

impl RunState {
    /// Terminal states end a run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::Error | Self::Aborted)
    }
}

/// An in-flight run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRun {
    pub session_key: SessionKey,
    pub state: RunState,
}

/// Set of runs the bridge believes are in flight.
///
/// Created once per process and shared through `Arc`. Only the bridge
/// mutates it; everything else reads.
#[derive(Debug, Default)]
pub struct RunTracker {
    runs: Mutex<HashMap<String, ActiveRun>>,
}

impl RunTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
        // A poisoned map is still a valid map.
        self.runs.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record a non-terminal event for `run_id`.
    pub fn observe(&self, run_id: &str, session_key: &str, state: RunState) {
        debug_assert!(!state.is_terminal());
        self.runs()
            .entry(run_id.to_string())
            .and_modify(|run| run.state = state)
            .or_insert_with(|| ActiveRun {
                session_key: session_key.to_string(),
                state,
            });
    }

    /// Remove a run on a terminal event. Returns the removed run, if any.
    pub fn finish(&self, run_id: &str) -> Option<ActiveRun> {
        self.runs().remove(run_id)
    }

    /// Drop every active run. Returns the distinct session keys that had
    /// at least one, in sorted order.
    pub fn clear(&self) -> Vec<SessionKey> {
        let mut sessions: Vec<SessionKey> = self
            .runs()
            .drain()
            .map(|(_, run)| run.session_key)
            .collect();
        sessions.sort();
        sessions.dedup();
        sessions
    }

    #[must_use]
    pub fn is_active(&self, run_id: &str) -> bool {
        self.runs().contains_key(run_id)
    }

    /// Number of generations believed in flight across all sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_then_finish() {
        let tracker = RunTracker::new();
        tracker.observe("r1", "a", RunState::Started);
        tracker.observe("r1", "a", RunState::Streaming);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.runs()["r1"].state, RunState::Streaming);

        assert!(tracker.finish("r1").is_some());
        assert!(tracker.finish("r1").is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_clear_reports_sessions_once() {
        let tracker = RunTracker::new();
        tracker.observe("r1", "b", RunState::Streaming);
        tracker.observe("r2", "a", RunState::Streaming);
        tracker.observe("r3", "b", RunState::Started);

        assert_eq!(tracker.clear(), vec!["a".to_string(), "b".to_string()]);
        assert!(tracker.is_empty());
        assert!(tracker.clear().is_empty());
    }
}
