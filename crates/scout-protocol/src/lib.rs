//! Canonical protocol types for Scout agent sessions.
//!
//! A Scout channel carries plain-text queries from the client and a stream of
//! tagged [`Event`]s back from the server. This crate holds everything both
//! ends agree on and nothing that performs I/O:
//!
//! - [`events`]: the event union and its JSON frame codec.
//! - [`tools`]: the tool-status tracker that turns `tool_start`/`tool_end`
//!   into a single displayable status line.
//! - [`assembler`]: the response buffer for one turn and its highlighting.
//! - [`view`]: a client-side fold of decoded events into tracker and
//!   assembler state.

pub mod assembler;
pub mod events;
pub mod tools;
pub mod view;

pub use assembler::{Highlight, Rendering, ResponseAssembler, Segment, Severity, render};
pub use events::{DecodeError, Decoded, Event, EventKind, ToolArgs, decode, encode};
pub use tools::{ToolInvocation, ToolTracker, describe};
pub use view::{TurnStatus, TurnUpdate, TurnView};
