//! Agent channels over WebSocket.
//!
//! Each connection at `GET /ws` gets its own [`AgentSession`](crate::session::AgentSession).
//! Clients send plain-text queries; the server answers with JSON protocol
//! events, one per text frame.

mod handler;

pub use handler::{ChannelParams, ws_handler};
