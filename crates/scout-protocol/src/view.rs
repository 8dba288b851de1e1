//! Client-side fold of channel events into displayable turn state.

use crate::assembler::ResponseAssembler;
use crate::events::{Decoded, Event};
use crate::tools::{ToolInvocation, ToolTracker};

/// Where the client is in the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnStatus {
    /// No turn active; input is enabled.
    #[default]
    Idle,
    /// A query was sent and `start_response` has not arrived yet.
    Submitted,
    /// `start_response` arrived; tool and content events may follow.
    Streaming,
}

/// What changed after applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnUpdate {
    Started,
    /// A tool status line should be shown, replacing any previous one.
    ToolStatus(String),
    /// The displayed tool status was cleared.
    ToolCleared,
    /// A fragment was appended to the response.
    Content(String),
    Completed,
    /// The turn failed. Partial response text has been discarded.
    Failed(String),
    /// A query submitted during the running turn was refused. The running
    /// turn is untouched.
    Rejected(String),
    /// The event carried nothing to display (unknown kind, stale `tool_end`,
    /// or an event outside of a turn).
    Ignored,
}

/// Tracker and assembler state for one channel, driven by decoded events.
#[derive(Debug, Clone, Default)]
pub struct TurnView {
    status: TurnStatus,
    tracker: ToolTracker,
    assembler: ResponseAssembler,
    last_error: Option<String>,
    /// Queries submitted while a turn was already running and not yet
    /// answered by the server.
    overlapping: usize,
}

impl TurnView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a query was sent.
    ///
    /// A query sent while a turn is running does not replace that turn; the
    /// server answers it with an `error`, which [`apply`](Self::apply) reports
    /// as [`TurnUpdate::Rejected`].
    pub fn submit(&mut self) {
        if self.status == TurnStatus::Idle {
            self.status = TurnStatus::Submitted;
            self.last_error = None;
        } else {
            self.overlapping += 1;
        }
    }

    pub fn apply_decoded(&mut self, decoded: Decoded) -> TurnUpdate {
        match decoded {
            Decoded::Event(event) => self.apply(event),
            Decoded::Unrecognized { .. } => TurnUpdate::Ignored,
        }
    }

    pub fn apply(&mut self, event: Event) -> TurnUpdate {
        match event {
            Event::StartResponse => {
                if self.status == TurnStatus::Idle && self.overlapping > 0 {
                    // An overlapping query outlived the turn it overlapped.
                    self.overlapping -= 1;
                }
                self.status = TurnStatus::Streaming;
                self.tracker.clear();
                self.assembler.reset();
                self.last_error = None;
                TurnUpdate::Started
            }
            Event::ToolStart { .. } if self.status != TurnStatus::Streaming => TurnUpdate::Ignored,
            Event::ToolStart {
                tool_name,
                args,
                description,
            } => {
                let invocation = ToolInvocation {
                    tool_name,
                    args,
                    description,
                };
                TurnUpdate::ToolStatus(self.tracker.on_tool_start(&invocation).to_string())
            }
            Event::Stream { .. } if self.status != TurnStatus::Streaming => TurnUpdate::Ignored,
            Event::Stream { content } => {
                self.tracker.clear();
                self.assembler.append(&content);
                TurnUpdate::Content(content)
            }
            Event::ToolEnd { tool_name } => {
                if self.tracker.on_tool_end(&tool_name) {
                    TurnUpdate::ToolCleared
                } else {
                    TurnUpdate::Ignored
                }
            }
            Event::EndResponse if self.status != TurnStatus::Streaming => TurnUpdate::Ignored,
            Event::EndResponse => {
                self.status = TurnStatus::Idle;
                self.tracker.clear();
                self.assembler.finish();
                TurnUpdate::Completed
            }
            Event::Error { message }
                if self.status == TurnStatus::Streaming && self.overlapping > 0 =>
            {
                self.overlapping -= 1;
                TurnUpdate::Rejected(message)
            }
            // Errors end the turn whether or not one was started: admission
            // rejections arrive without a preceding `start_response`.
            Event::Error { message } => {
                self.status = TurnStatus::Idle;
                self.tracker.clear();
                self.assembler.reset();
                self.last_error = Some(message.clone());
                TurnUpdate::Failed(message)
            }
        }
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    /// Whether the user may submit the next query.
    pub fn input_enabled(&self) -> bool {
        self.status == TurnStatus::Idle
    }

    pub fn tool_status(&self) -> Option<&str> {
        self.tracker.status()
    }

    pub fn text(&self) -> &str {
        self.assembler.text()
    }

    pub fn assembler(&self) -> &ResponseAssembler {
        &self.assembler
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::decode;
    use serde_json::json;

    fn args(value: serde_json::Value) -> crate::ToolArgs {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_price_lookup_turn() {
        let mut view = TurnView::new();
        view.submit();
        assert!(!view.input_enabled());

        assert_eq!(view.apply(Event::StartResponse), TurnUpdate::Started);
        assert_eq!(
            view.apply(Event::tool_start(
                "web_search",
                args(json!({"query": "widget X price"})),
                None
            )),
            TurnUpdate::ToolStatus("searching for: `widget X price`".to_string())
        );
        assert_eq!(view.tool_status(), Some("searching for: `widget X price`"));

        view.apply(Event::stream("The price is..."));
        assert_eq!(view.tool_status(), None);

        assert_eq!(view.apply(Event::EndResponse), TurnUpdate::Completed);
        assert_eq!(view.text(), "The price is...");
        assert!(view.input_enabled());
        assert!(view.assembler().is_finished());
    }

    #[test]
    fn test_immediate_failure_leaves_no_text() {
        let mut view = TurnView::new();
        view.submit();
        view.apply(Event::StartResponse);
        view.apply(Event::stream("partial"));

        assert_eq!(
            view.apply(Event::error("rate limited")),
            TurnUpdate::Failed("rate limited".to_string())
        );
        assert!(view.input_enabled());
        assert_eq!(view.text(), "");
        assert_eq!(view.last_error(), Some("rate limited"));
    }

    #[test]
    fn test_rejection_without_start_response() {
        let mut view = TurnView::new();
        view.submit();
        let update = view.apply(Event::error("[12:00:00] Rate limit exceeded"));
        assert!(matches!(update, TurnUpdate::Failed(_)));
        assert!(view.input_enabled());
    }

    #[test]
    fn test_stray_events_are_ignored() {
        let mut view = TurnView::new();
        assert_eq!(view.apply(Event::stream("late")), TurnUpdate::Ignored);
        assert_eq!(view.apply(Event::EndResponse), TurnUpdate::Ignored);
        assert_eq!(view.apply(Event::tool_end("web_search")), TurnUpdate::Ignored);
        assert_eq!(view.text(), "");
        assert_eq!(view.status(), TurnStatus::Idle);
    }

    #[test]
    fn test_unrecognized_frames_are_ignored() {
        let mut view = TurnView::new();
        view.apply(Event::StartResponse);
        let decoded = decode(r#"{"type":"metrics","cpu":3}"#).unwrap();
        assert_eq!(view.apply_decoded(decoded), TurnUpdate::Ignored);
        assert_eq!(view.status(), TurnStatus::Streaming);
    }

    #[test]
    fn test_next_turn_starts_clean() {
        let mut view = TurnView::new();
        view.apply(Event::StartResponse);
        view.apply(Event::stream("first answer"));
        view.apply(Event::EndResponse);

        view.submit();
        view.apply(Event::StartResponse);
        view.apply(Event::stream("second"));
        assert_eq!(view.text(), "second");
    }

    #[test]
    fn test_query_sent_mid_turn_does_not_end_the_turn() {
        let mut view = TurnView::new();
        view.submit();
        view.apply(Event::StartResponse);
        view.apply(Event::stream("first line\n"));

        view.submit();
        assert_eq!(view.status(), TurnStatus::Streaming);
        assert!(!view.input_enabled());

        let rejection = "[12:05:05] A response is already in progress.";
        assert_eq!(
            view.apply(Event::error(rejection)),
            TurnUpdate::Rejected(rejection.to_string())
        );
        assert_eq!(view.text(), "first line\n");
        assert_eq!(view.last_error(), None);

        assert_eq!(
            view.apply(Event::stream("second line\n")),
            TurnUpdate::Content("second line\n".to_string())
        );
        assert_eq!(view.apply(Event::EndResponse), TurnUpdate::Completed);
        assert_eq!(view.text(), "first line\nsecond line\n");
        assert!(view.input_enabled());
    }

    #[test]
    fn test_turn_failure_after_overlapping_rejection() {
        let mut view = TurnView::new();
        view.submit();
        view.apply(Event::StartResponse);
        view.submit();
        view.apply(Event::error("busy"));

        assert_eq!(
            view.apply(Event::error("rate limited")),
            TurnUpdate::Failed("rate limited".to_string())
        );
        assert!(view.input_enabled());
    }

    #[test]
    fn test_duplicate_tool_end() {
        let mut view = TurnView::new();
        view.apply(Event::StartResponse);
        view.apply(Event::tool_start("calc", args(json!({})), None));
        assert_eq!(view.apply(Event::tool_end("calc")), TurnUpdate::ToolCleared);
        assert_eq!(view.apply(Event::tool_end("calc")), TurnUpdate::Ignored);
    }
}
