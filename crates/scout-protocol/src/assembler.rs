//! Response buffer for one assistant turn, plus its highlighting.

use once_cell::sync::Lazy;
use regex::Regex;

static TIMESTAMP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\d{2}:\d{2}:\d{2}\]").expect("valid timestamp regex"));

static SEVERITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[?(CRITICAL|ERROR|WARNING|WARN|INFO|DEBUG)\b")
        .expect("valid severity regex")
});

/// Accumulates `stream` fragments of the current turn.
///
/// Fragments are concatenated in arrival order. Once the turn is finished the
/// buffer is frozen until the next [`reset`](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct ResponseAssembler {
    text: String,
    finished: bool,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the full text so far.
    ///
    /// Appends after [`finish`](Self::finish) are dropped.
    pub fn append(&mut self, fragment: &str) -> &str {
        if !self.finished {
            self.text.push_str(fragment);
        }
        &self.text
    }

    /// Start a new turn with an empty buffer.
    pub fn reset(&mut self) {
        self.text.clear();
        self.finished = false;
    }

    /// Freeze the buffer at the end of the turn.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn render(&self) -> Rendering {
        render(&self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl Severity {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "CRITICAL" => Some(Self::Critical),
            "ERROR" => Some(Self::Error),
            "WARNING" | "WARN" => Some(Self::Warning),
            "INFO" => Some(Self::Info),
            "DEBUG" => Some(Self::Debug),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Highlight {
    Plain,
    Timestamp,
    Severity(Severity),
}

/// A run of text with a single highlight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub highlight: Highlight,
}

impl Segment {
    fn new(text: &str, highlight: Highlight) -> Self {
        Self {
            text: text.to_string(),
            highlight,
        }
    }
}

/// Highlighted view of an accumulated response.
///
/// Only complete lines are committed. The trailing partial line stays in
/// `pending` until its newline arrives, so a keyword or timestamp split
/// across two fragments is never highlighted half-way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendering {
    pub committed: Vec<Segment>,
    pub pending: String,
}

impl Rendering {
    /// The rendered text without highlighting.
    pub fn plain_text(&self) -> String {
        let mut out: String = self.committed.iter().map(|s| s.text.as_str()).collect();
        out.push_str(&self.pending);
        out
    }
}

/// Render accumulated text.
///
/// Each complete line is highlighted independently of every other line, so
/// rendering a longer prefix of the same text only appends to `committed`.
pub fn render(text: &str) -> Rendering {
    let (complete, pending) = match text.rfind('\n') {
        Some(idx) => text.split_at(idx + 1),
        None => ("", text),
    };

    let mut committed = Vec::new();
    for line in complete.split_inclusive('\n') {
        render_line(line, &mut committed);
    }

    Rendering {
        committed,
        pending: pending.to_string(),
    }
}

fn render_line(line: &str, out: &mut Vec<Segment>) {
    if let Some(severity) = SEVERITY_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| Severity::from_keyword(m.as_str()))
    {
        out.push(Segment::new(line, Highlight::Severity(severity)));
        return;
    }

    let mut last = 0;
    for m in TIMESTAMP_RE.find_iter(line) {
        if m.start() > last {
            out.push(Segment::new(&line[last..m.start()], Highlight::Plain));
        }
        out.push(Segment::new(m.as_str(), Highlight::Timestamp));
        last = m.end();
    }
    if last < line.len() {
        out.push(Segment::new(&line[last..], Highlight::Plain));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_concatenation_in_order() {
        let cases: &[&[&str]] = &[
            &[],
            &["The price is..."],
            &["The ", "price ", "is", "..."],
            &["", "a", "", "b\n", "c"],
            &["日本", "語", "\n", "ü"],
        ];
        for fragments in cases {
            let mut assembler = ResponseAssembler::new();
            for fragment in fragments.iter() {
                assembler.append(fragment);
            }
            assert_eq!(assembler.text(), fragments.concat());
        }
    }

    #[test]
    fn test_append_returns_full_text() {
        let mut assembler = ResponseAssembler::new();
        assert_eq!(assembler.append("ab"), "ab");
        assert_eq!(assembler.append("cd"), "abcd");
    }

    #[test]
    fn test_reset_discards_previous_turn() {
        let mut dirty = ResponseAssembler::new();
        dirty.append("stale partial answer");
        dirty.finish();
        dirty.reset();

        let mut fresh = ResponseAssembler::new();
        for fragment in ["new ", "answer"] {
            dirty.append(fragment);
            fresh.append(fragment);
        }
        assert_eq!(dirty.text(), fresh.text());
        assert!(!dirty.is_finished());
    }

    #[test]
    fn test_finished_buffer_is_frozen() {
        let mut assembler = ResponseAssembler::new();
        assembler.append("done");
        assembler.finish();
        assert_eq!(assembler.append(" late"), "done");
        assert!(assembler.is_finished());
    }

    #[test]
    fn test_render_plain_text_is_identity() {
        for text in ["", "abc", "a\nb", "a\n\n", "[12:00:01] x\nERROR: y\nz"] {
            assert_eq!(render(text).plain_text(), text);
        }
    }

    #[test]
    fn test_render_highlights_timestamps() {
        let rendering = render("at [09:15:00] the job ran [09:15:07]\n");
        assert_eq!(
            rendering.committed,
            vec![
                Segment::new("at ", Highlight::Plain),
                Segment::new("[09:15:00]", Highlight::Timestamp),
                Segment::new(" the job ran ", Highlight::Plain),
                Segment::new("[09:15:07]", Highlight::Timestamp),
                Segment::new("\n", Highlight::Plain),
            ]
        );
        assert!(rendering.pending.is_empty());
    }

    #[test]
    fn test_render_highlights_severity_lines() {
        let rendering = render("ERROR: disk full\nWARNING low memory\n[INFO] ok\nERRORS are fine\n");
        let highlights: Vec<_> = rendering.committed.iter().map(|s| s.highlight).collect();
        assert_eq!(
            highlights,
            vec![
                Highlight::Severity(Severity::Error),
                Highlight::Severity(Severity::Warning),
                Highlight::Severity(Severity::Info),
                Highlight::Plain,
            ]
        );
    }

    #[test]
    fn test_render_keeps_partial_line_pending() {
        let rendering = render("line one\nERR");
        assert_eq!(rendering.committed.len(), 1);
        assert_eq!(rendering.pending, "ERR");
    }

    #[test]
    fn test_render_is_idempotent() {
        let text = "[10:00:00] start\nCRITICAL: boom\ntail";
        assert_eq!(render(text), render(text));
    }

    #[test]
    fn test_longer_prefix_extends_committed() {
        let text = "intro [10:00:00]\nDEBUG: step\nWARN x\nplain [11:11:11] end\nrest";
        let full = render(text);
        for end in 0..=text.len() {
            if !text.is_char_boundary(end) {
                continue;
            }
            let prefix = render(&text[..end]);
            assert!(
                full.committed.starts_with(&prefix.committed),
                "prefix of length {end} is not extended"
            );
        }
    }
}
