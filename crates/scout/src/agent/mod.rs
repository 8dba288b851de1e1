//! Agent loop collaborator seam.
//!
//! The session layer treats the reasoning/tool-use process as a black-box
//! event source. An [`AgentLoop`] is started once per turn and hands back a
//! [`LoopRun`]: a bounded receiver of [`LoopEvent`]s plus a stop token. The
//! loop runs on its own task and publishes through a [`LoopEmitter`].
//!
//! ```text
//!   AgentSession ── start(query, model) ──▶ AgentLoop
//!        ▲                                     │ spawn
//!        │  LoopRun::next()                    ▼
//!        └──────────── mpsc ◀──────────── LoopEmitter::emit()
//!                       stop ───────────▶ LoopEmitter::stopped()
//! ```
//!
//! Implementations: [`OpenAiLoop`] (streaming chat completions with tools)
//! and [`ScriptedLoop`] (deterministic scripts and the offline echo
//! provider).

mod openai;
mod scripted;
pub mod tools;

pub use openai::{OpenAiCatalog, OpenAiConfig, OpenAiLoop};
pub use scripted::{ScriptStep, ScriptedLoop, StaticCatalog};
pub use tools::{PageSummary, SearchResult, ToolBox, ToolError};

use async_trait::async_trait;
use scout_protocol::ToolArgs;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default buffer between a running loop and its session.
pub const LOOP_EVENT_BUFFER: usize = 64;

/// Event produced by a running agent loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    ToolInvoked {
        name: String,
        args: ToolArgs,
        description: Option<String>,
    },
    ToolCompleted {
        name: String,
    },
    ContentChunk {
        text: String,
    },
    Completed,
    Failed {
        reason: String,
    },
}

impl LoopEvent {
    pub fn tool_invoked(name: impl Into<String>, args: ToolArgs) -> Self {
        Self::ToolInvoked {
            name: name.into(),
            args,
            description: None,
        }
    }

    pub fn tool_completed(name: impl Into<String>) -> Self {
        Self::ToolCompleted { name: name.into() }
    }

    pub fn chunk(text: impl Into<String>) -> Self {
        Self::ContentChunk { text: text.into() }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

/// Errors that prevent a loop from starting.
#[derive(Debug, Clone, Error)]
pub enum LoopError {
    #[error("model '{0}' is not available")]
    ModelUnavailable(String),

    #[error("agent is not configured: {0}")]
    NotConfigured(String),

    #[error("agent backend unavailable: {0}")]
    Unavailable(String),
}

/// Handle to one running agent loop.
///
/// Dropping the handle requests a stop, so a session that loses its run for
/// any reason never leaves a loop working for nobody.
#[derive(Debug)]
pub struct LoopRun {
    events: mpsc::Receiver<LoopEvent>,
    stop: CancellationToken,
}

impl LoopRun {
    /// Create a run handle and the emitter the loop task publishes through.
    pub fn channel(buffer: usize) -> (Self, LoopEmitter) {
        let (tx, rx) = mpsc::channel(buffer);
        let stop = CancellationToken::new();
        let run = Self {
            events: rx,
            stop: stop.clone(),
        };
        (run, LoopEmitter { tx, stop })
    }

    /// Next loop event, or `None` once the loop has gone away.
    pub async fn next(&mut self) -> Option<LoopEvent> {
        self.events.recv().await
    }

    /// Request best-effort interruption. Events already buffered stay in the
    /// channel; callers that stop a run discard it.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for LoopRun {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Publishing side of a [`LoopRun`].
#[derive(Debug, Clone)]
pub struct LoopEmitter {
    tx: mpsc::Sender<LoopEvent>,
    stop: CancellationToken,
}

impl LoopEmitter {
    /// Publish an event. Returns `false` when the run was stopped or its
    /// handle dropped; the loop should wind down.
    pub async fn emit(&self, event: LoopEvent) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once a stop was requested or the handle was dropped.
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

/// External reasoning/tool-use process.
#[async_trait]
pub trait AgentLoop: Send + Sync {
    /// Start a loop for `query`. `model` is `None` when the client did not
    /// select one; implementations fall back to their default.
    async fn start(&self, query: &str, model: Option<&str>) -> Result<LoopRun, LoopError>;
}

/// Source of selectable model identifiers.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Ordered model ids. Backends that cannot be reached report their
    /// configured models instead of failing.
    async fn list_models(&self) -> Vec<String>;

    /// Model used when a channel does not select one.
    fn default_model(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emitter_delivers_in_order() {
        let (mut run, emitter) = LoopRun::channel(4);
        tokio::spawn(async move {
            emitter.emit(LoopEvent::chunk("a")).await;
            emitter.emit(LoopEvent::chunk("b")).await;
            emitter.emit(LoopEvent::Completed).await;
        });

        assert_eq!(run.next().await, Some(LoopEvent::chunk("a")));
        assert_eq!(run.next().await, Some(LoopEvent::chunk("b")));
        assert_eq!(run.next().await, Some(LoopEvent::Completed));
        assert_eq!(run.next().await, None);
    }

    #[tokio::test]
    async fn test_stop_is_visible_to_emitter() {
        let (run, emitter) = LoopRun::channel(1);
        assert!(!emitter.is_stopped());

        run.stop();
        assert!(emitter.is_stopped());
        assert!(!emitter.emit(LoopEvent::chunk("late")).await);
        emitter.stopped().await;
    }

    #[tokio::test]
    async fn test_dropping_run_stops_loop() {
        let (run, emitter) = LoopRun::channel(1);
        drop(run);
        emitter.stopped().await;
        assert!(emitter.is_stopped());
    }

    #[tokio::test]
    async fn test_emit_unblocks_on_stop_when_buffer_full() {
        let (run, emitter) = LoopRun::channel(1);
        assert!(emitter.emit(LoopEvent::chunk("fills buffer")).await);

        let blocked = {
            let emitter = emitter.clone();
            tokio::spawn(async move { emitter.emit(LoopEvent::chunk("blocked")).await })
        };
        tokio::task::yield_now().await;
        run.stop();

        assert!(!blocked.await.unwrap());
    }
}
