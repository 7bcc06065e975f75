//! Core abstractions for chat session synchronization.
//!
//! This crate provides the building blocks shared by the bridge and the
//! client engine:
//! - `Content` - Heterogeneous runtime content with one text extractor
//! - `PushEvent` / `ClientRequest` - Push-channel protocol
//! - `RunTracker` - Registry of in-flight runs
//! - `EventHub` - Broadcast fan-out of push events
//! - `Gateway` / `RequestSink` - Collaborator contracts

pub mod config;
pub mod config_patch;
pub mod content;
pub mod event;
pub mod event_hub;
pub mod message;
pub mod rate_limit;
pub mod run_tracker;
pub mod traits;

pub use config::{ConfigError, SyncConfig};
pub use config_patch::patch_config_with_retry;
pub use content::Content;
pub use event::{AgentStatus, ClientRequest, PushEvent};
pub use event_hub::EventHub;
pub use message::{HistoryEntry, Message, Role, SessionKey};
pub use rate_limit::RateTracker;
pub use run_tracker::{RunState, RunTracker};
pub use traits::{Gateway, GatewayError, RequestSink, TransportError};
