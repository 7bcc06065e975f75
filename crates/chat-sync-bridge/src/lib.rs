//! Gateway event bridge for the agent runtime.
//!
//! Provides:
//! - Runtime frame decoding (`chat`, `agent`, `system` events)
//! - `GatewayBridge` - Run tracking and push-event broadcast, with reconnect
//! - `ChatService` - Forwarding of client send/abort requests to the runtime
//! - `MemoryGateway` - In-memory runtime for tests and demos

pub mod bridge;
pub mod chat;
pub mod memory;
pub mod runtime_event;

pub use bridge::{BridgeError, FrameStream, GatewayBridge, RuntimeConnector};
pub use chat::ChatService;
pub use memory::{MemoryGateway, MemoryGatewayBuilder, ReplyMode};
pub use runtime_event::{AgentEvent, ChatEvent, ChatState, RuntimeFrame};
