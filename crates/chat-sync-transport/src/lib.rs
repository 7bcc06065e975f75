//! Push channel transport for browser clients.
//!
//! Provides:
//! - Wire protocol (`ClientMessage` in, push events and control replies out)
//! - WebSocket router fanning the event hub out to every socket

pub mod protocol;
pub mod websocket;

pub use protocol::{ClientMessage, Control, ServerMessage};
pub use websocket::{WsState, create_ws_router, ws_handler};
