//! Client-side session synchronization.
//!
//! Provides:
//! - `SessionState` - Transcript, dedup and reconciliation rules
//! - `Schedule` - Poll cadence, safety deadline and notice timers
//! - `SyncEngine` - Task merging push events with history polling
//! - `SessionController` - Send/abort/switch/reset entry points

pub mod controller;
pub mod engine;
pub mod schedule;
pub mod state;

pub use controller::{ControllerError, SessionController};
pub use engine::{PollReason, SyncEngine};
pub use schedule::{Cadence, Schedule};
pub use state::{SessionState, SessionView};
