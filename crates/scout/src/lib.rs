//! Scout: a real-time research agent served over WebSocket channels.

pub mod admission;
pub mod agent;
pub mod api;
pub mod client;
pub mod session;
pub mod ws;
