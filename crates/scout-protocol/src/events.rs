//! Channel events and their JSON frame codec.
//!
//! Every server-to-client message is a JSON object whose `type` field selects
//! the event kind. Decoding is deliberately tolerant in one direction only:
//! a frame with a `type` this build does not know about is reported as
//! [`Decoded::Unrecognized`] so that older clients keep working against newer
//! servers, while a frame of a *known* kind with missing or mistyped fields is
//! a [`DecodeError`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Argument mapping attached to a tool invocation.
///
/// Keys are unique; values are whatever the agent loop passed to the tool.
pub type ToolArgs = Map<String, Value>;

// ============================================================================
// Events (Server -> Client)
// ============================================================================

/// Events sent from the server to the client over a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new assistant turn has begun.
    StartResponse,

    /// The agent loop is invoking a tool.
    ToolStart {
        tool_name: String,
        args: ToolArgs,
        /// Human-readable status supplied by the agent loop.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    /// Incremental answer content.
    Stream { content: String },

    /// The named tool call finished.
    ToolEnd { tool_name: String },

    /// The turn is complete; the client may submit the next query.
    EndResponse,

    /// The turn failed. The turn is nonetheless complete.
    Error { message: String },
}

impl Event {
    /// Build a `tool_start` event.
    pub fn tool_start(
        tool_name: impl Into<String>,
        args: ToolArgs,
        description: Option<String>,
    ) -> Self {
        Self::ToolStart {
            tool_name: tool_name.into(),
            args,
            description,
        }
    }

    /// Build a `stream` event.
    pub fn stream(content: impl Into<String>) -> Self {
        Self::Stream {
            content: content.into(),
        }
    }

    /// Build a `tool_end` event.
    pub fn tool_end(tool_name: impl Into<String>) -> Self {
        Self::ToolEnd {
            tool_name: tool_name.into(),
        }
    }

    /// Build an `error` event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::StartResponse => EventKind::StartResponse,
            Self::ToolStart { .. } => EventKind::ToolStart,
            Self::Stream { .. } => EventKind::Stream,
            Self::ToolEnd { .. } => EventKind::ToolEnd,
            Self::EndResponse => EventKind::EndResponse,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Whether this event ends the current turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EndResponse | Self::Error { .. })
    }
}

/// Discriminant of an [`Event`], as written in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StartResponse,
    ToolStart,
    Stream,
    ToolEnd,
    EndResponse,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::StartResponse,
        EventKind::ToolStart,
        EventKind::Stream,
        EventKind::ToolEnd,
        EventKind::EndResponse,
        EventKind::Error,
    ];

    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartResponse => "start_response",
            Self::ToolStart => "tool_start",
            Self::Stream => "stream",
            Self::ToolEnd => "tool_end",
            Self::EndResponse => "end_response",
            Self::Error => "error",
        }
    }

    /// Look up a kind by its wire name.
    pub fn from_discriminant(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Outcome of decoding a well-formed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A frame of a known kind.
    Event(Event),
    /// A frame whose discriminant this build does not know. Consumers log it
    /// and move on.
    Unrecognized { kind: String },
}

/// A frame that could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `type` discriminant")]
    MissingDiscriminant,

    #[error("malformed `{kind}` frame: {source}")]
    Malformed {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode an event as a text frame.
pub fn encode(event: &Event) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

/// Decode a text frame.
pub fn decode(frame: &str) -> Result<Decoded, DecodeError> {
    let value: Value = serde_json::from_str(frame).map_err(DecodeError::InvalidJson)?;

    let Some(object) = value.as_object() else {
        return Err(DecodeError::NotAnObject);
    };
    let Some(tag) = object.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::MissingDiscriminant);
    };
    let Some(kind) = EventKind::from_discriminant(tag) else {
        return Ok(Decoded::Unrecognized {
            kind: tag.to_string(),
        });
    };

    serde_json::from_value::<Event>(value)
        .map(Decoded::Event)
        .map_err(|source| DecodeError::Malformed { kind, source })
}
