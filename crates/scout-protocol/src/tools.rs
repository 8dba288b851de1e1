//! Tool status tracking for display.
//!
//! The tracker keeps at most one "currently displayed" tool per session. A
//! new `tool_start` always takes the slot, even when the previous tool never
//! reported `tool_end`; statuses are advisory, not an audit log.

use serde_json::Value;

use crate::events::{Event, ToolArgs};

/// Tool name used by the agent loop for web searches.
pub const WEB_SEARCH: &str = "web_search";

/// Tool name used by the agent loop for fetching and parsing a page.
pub const PARSE_WEBSITE: &str = "parse_website";

/// Longest search query shown verbatim in a status line.
const MAX_QUERY_DISPLAY_CHARS: usize = 30;

/// One tool call announced by the agent loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub args: ToolArgs,
    pub description: Option<String>,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>, args: ToolArgs) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Extract the invocation carried by a `tool_start` event.
    pub fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::ToolStart {
                tool_name,
                args,
                description,
            } => Some(Self {
                tool_name: tool_name.clone(),
                args: args.clone(),
                description: description.clone(),
            }),
            _ => None,
        }
    }

    /// String value of an argument, if present and non-empty.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Status line for a tool invocation.
///
/// A description supplied by the agent loop wins; otherwise the line is
/// synthesized from a per-tool template, with unknown tools falling back to
/// a generic one.
pub fn describe(invocation: &ToolInvocation) -> String {
    if let Some(description) = invocation
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
    {
        return description.to_string();
    }

    match invocation.tool_name.as_str() {
        WEB_SEARCH => match invocation.arg_str("query") {
            Some(query) => format!("searching for: `{}`", shorten(query)),
            None => "searching the web".to_string(),
        },
        PARSE_WEBSITE => match invocation.arg_str("url").and_then(url_host) {
            Some(host) => format!("connecting to `{host}`"),
            None => generic(&invocation.tool_name),
        },
        other => generic(other),
    }
}

fn generic(tool_name: &str) -> String {
    format!("initializing `{tool_name}`")
}

fn shorten(query: &str) -> String {
    if query.chars().count() <= MAX_QUERY_DISPLAY_CHARS {
        return query.to_string();
    }
    let mut short: String = query.chars().take(MAX_QUERY_DISPLAY_CHARS).collect();
    short.push_str("...");
    short
}

/// Network location (`host[:port]`) of a URL, without scheme, credentials or
/// path.
fn url_host(url: &str) -> Option<&str> {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url.strip_prefix("//")?,
    };
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let host = match authority.rfind('@') {
        Some(idx) => &authority[idx + 1..],
        None => authority,
    };
    (!host.is_empty()).then_some(host)
}

#[derive(Debug, Clone, PartialEq)]
struct DisplayedTool {
    tool_name: String,
    status: String,
}

/// Tracks the tool status currently shown for one session.
#[derive(Debug, Clone, Default)]
pub struct ToolTracker {
    displayed: Option<DisplayedTool>,
}

impl ToolTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a newly started tool, replacing whatever was shown, and return
    /// its status line.
    pub fn on_tool_start(&mut self, invocation: &ToolInvocation) -> &str {
        let status = describe(invocation);
        let displayed = self.displayed.insert(DisplayedTool {
            tool_name: invocation.tool_name.clone(),
            status,
        });
        &displayed.status
    }

    /// Clear the display if `tool_name` is the tool being shown.
    ///
    /// Returns whether anything was cleared. An end for a tool that is no
    /// longer displayed is ignored.
    pub fn on_tool_end(&mut self, tool_name: &str) -> bool {
        match &self.displayed {
            Some(displayed) if displayed.tool_name == tool_name => {
                self.displayed = None;
                true
            }
            _ => false,
        }
    }

    /// Clear the display unconditionally (content arrived or the turn ended).
    pub fn clear(&mut self) {
        self.displayed = None;
    }

    /// Name of the displayed tool.
    pub fn active_tool(&self) -> Option<&str> {
        self.displayed.as_ref().map(|d| d.tool_name.as_str())
    }

    /// Status line currently displayed.
    pub fn status(&self) -> Option<&str> {
        self.displayed.as_ref().map(|d| d.status.as_str())
    }
}
