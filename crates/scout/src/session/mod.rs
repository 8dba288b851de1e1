//! Agent sessions: one per open channel.
//!
//! An [`AgentSession`] owns the channel's turn state machine. It receives
//! plain-text queries, starts the agent loop, forwards loop events as
//! protocol [`Event`]s through a single outbound queue, and reacts to
//! cancellation. All mutation happens on the task running
//! [`AgentSession::drive`]; other tasks only observe the phase and hold the
//! cancellation token through the [`SessionRegistry`].
//!
//! ```text
//!            query                 first loop event
//!   Idle ───────────▶ AwaitingFirstEvent ───────────▶ Streaming
//!    ▲  ◀── start failed ──┘                             │
//!    └──────────── Completed / Failed / stream ended ────┘
//!
//!   any ── cancel ──▶ Cancelling ──▶ channel closed
//! ```

mod registry;

pub use registry::{SessionHandle, SessionInfo, SessionRegistry};

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use scout_protocol::Event;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admission::{Admission, Screened, stamped};
use crate::agent::{AgentLoop, LoopError, LoopEvent, LoopRun};

/// Message shown when the loop's event stream ends without a terminal event.
pub const LOOP_ENDED_EARLY: &str = "The agent stopped before completing its response.";

/// Close reason sent when the server ends a session.
pub const CANCEL_REASON: &str = "cancelled by server";

/// Message shown when a query arrives during an active turn.
pub const TURN_IN_PROGRESS: &str =
    "A response is already in progress. Wait for it to finish before sending another message.";

/// Turn phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    AwaitingFirstEvent,
    Streaming,
    Cancelling,
}

impl Phase {
    /// Whether a turn is in flight.
    pub fn is_active(self) -> bool {
        matches!(self, Self::AwaitingFirstEvent | Self::Streaming)
    }
}

/// Item queued for the channel writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(Event),
    /// Close the channel after everything queued before it was written.
    Close { reason: String },
}

/// Session-level failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed or out-of-sequence input. Logged; the channel stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The agent loop could not be started. The session stays usable.
    #[error("agent failed to start: {0}")]
    AgentStart(#[from] LoopError),

    /// The channel can no longer be written. Terminates the session.
    #[error("channel error: {0}")]
    Channel(String),

    /// Cancelled while waiting on the channel writer.
    #[error("session cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Channel(_) | Self::Cancelled)
    }
}

/// Why [`AgentSession::drive`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Cancelled server-side; a close was queued for the channel.
    Cancelled,
    /// The peer closed the channel.
    PeerClosed,
    /// The outbound queue is gone.
    ChannelLost,
}

/// State machine for one channel.
pub struct AgentSession {
    id: Uuid,
    model: Option<String>,
    agent: Arc<dyn AgentLoop>,
    outbound: mpsc::Sender<Outbound>,
    phase: watch::Sender<Phase>,
    cancel: CancellationToken,
    run: Option<LoopRun>,
    admission: Arc<Admission>,
    client: IpAddr,
}

impl AgentSession {
    pub(crate) fn new(
        id: Uuid,
        model: Option<String>,
        agent: Arc<dyn AgentLoop>,
        outbound: mpsc::Sender<Outbound>,
        phase: watch::Sender<Phase>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            model,
            agent,
            outbound,
            phase,
            cancel,
            run: None,
            admission: Arc::new(Admission::unlimited()),
            client: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Screen raw channel input with `admission`, attributing it to `client`.
    pub fn with_admission(mut self, admission: Arc<Admission>, client: IpAddr) -> Self {
        self.admission = admission;
        self.client = client;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!("session {}: {:?} -> {:?}", self.id, previous, phase);
        }
    }

    /// Queue an event for the writer. A stalled writer never holds up
    /// cancellation.
    async fn send_event(&self, event: Event) -> Result<(), SessionError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            sent = self.outbound.send(Outbound::Event(event)) => {
                sent.map_err(|_| SessionError::Channel("outbound queue closed".to_string()))
            }
        }
    }

    /// Reject input with one timestamped `error` event. No turn starts.
    async fn reject(&self, message: &str) -> Result<(), SessionError> {
        self.send_event(Event::error(stamped(message))).await?;
        Err(SessionError::Protocol(message.to_string()))
    }

    /// Handle one raw text frame from the client.
    pub async fn on_inbound(&mut self, text: String) -> Result<(), SessionError> {
        let query = match self.admission.screen(&text) {
            Screened::Ignore => return Ok(()),
            Screened::Reject(message) => return self.reject(&message).await,
            Screened::Accept(query) => query,
        };
        if self.phase().is_active() {
            return self.reject(TURN_IN_PROGRESS).await;
        }
        if let Some(message) = self.admission.admit(self.client) {
            return self.reject(&message).await;
        }
        self.submit(query).await
    }

    /// Start a turn for `query`.
    ///
    /// `start_response` is queued before the agent loop is asked to start, so
    /// it precedes every loop event.
    pub async fn submit(&mut self, query: String) -> Result<(), SessionError> {
        if self.phase() != Phase::Idle {
            return self.reject(TURN_IN_PROGRESS).await;
        }

        self.set_phase(Phase::AwaitingFirstEvent);
        self.send_event(Event::StartResponse).await?;

        match self.agent.start(&query, self.model.as_deref()).await {
            Ok(run) => {
                info!("session {}: turn started", self.id);
                self.run = Some(run);
                Ok(())
            }
            Err(err) => {
                warn!("session {}: agent failed to start: {err}", self.id);
                self.set_phase(Phase::Idle);
                self.send_event(Event::error(err.to_string())).await?;
                Err(SessionError::AgentStart(err))
            }
        }
    }

    /// Apply one item from the running loop. `None` means the loop's event
    /// stream ended.
    pub async fn on_loop_event(&mut self, event: Option<LoopEvent>) -> Result<(), SessionError> {
        let phase = self.phase();
        if !phase.is_active() {
            // Late results after a turn ended or during cancellation.
            if let Some(event) = event {
                debug!("session {}: discarding {event:?} in {phase:?}", self.id);
            }
            return Ok(());
        }

        let Some(event) = event else {
            warn!("session {}: agent loop ended without a result", self.id);
            self.run = None;
            self.set_phase(Phase::Idle);
            return self.send_event(Event::error(LOOP_ENDED_EARLY)).await;
        };

        if phase == Phase::AwaitingFirstEvent {
            self.set_phase(Phase::Streaming);
        }

        match event {
            LoopEvent::ToolInvoked {
                name,
                args,
                description,
            } => {
                self.send_event(Event::tool_start(name, args, description))
                    .await
            }
            LoopEvent::ToolCompleted { name } => self.send_event(Event::tool_end(name)).await,
            LoopEvent::ContentChunk { text } => self.send_event(Event::stream(text)).await,
            LoopEvent::Completed => {
                self.run = None;
                self.set_phase(Phase::Idle);
                info!("session {}: turn completed", self.id);
                self.send_event(Event::EndResponse).await
            }
            LoopEvent::Failed { reason } => {
                self.run = None;
                self.set_phase(Phase::Idle);
                info!("session {}: turn failed: {reason}", self.id);
                self.send_event(Event::error(reason)).await
            }
        }
    }

    /// Stop the turn and close the channel. Loop events still in flight are
    /// discarded.
    pub async fn cancel(&mut self, reason: &str) {
        self.set_phase(Phase::Cancelling);
        if let Some(run) = self.run.take() {
            run.stop();
        }
        info!("session {}: cancelled ({reason})", self.id);
        let close = Outbound::Close {
            reason: reason.to_string(),
        };
        // A full queue means the writer is stuck; the channel task tears the
        // socket down without the close frame.
        if let Err(err) = self.outbound.try_send(close) {
            debug!("session {}: close frame not queued: {err}", self.id);
        }
    }

    /// Decide whether an error ends the session.
    async fn end_after(&mut self, err: SessionError) -> Option<SessionEnd> {
        match err {
            SessionError::Cancelled => {
                self.cancel(CANCEL_REASON).await;
                Some(SessionEnd::Cancelled)
            }
            err if err.is_fatal() => {
                warn!("session {}: {err}", self.id);
                self.abandon();
                Some(SessionEnd::ChannelLost)
            }
            err => {
                debug!("session {}: {err}", self.id);
                None
            }
        }
    }

    /// Best-effort stop after the peer went away. Sends nothing.
    fn abandon(&mut self) {
        self.set_phase(Phase::Cancelling);
        if let Some(run) = self.run.take() {
            run.stop();
            debug!("session {}: stopped loop after peer left", self.id);
        }
    }

    /// Run the session until it is cancelled or the channel goes away.
    pub async fn drive<S>(mut self, mut inbound: S) -> SessionEnd
    where
        S: Stream<Item = String> + Unpin,
    {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.cancel(CANCEL_REASON).await;
                    return SessionEnd::Cancelled;
                }

                text = inbound.next() => {
                    let Some(text) = text else {
                        self.abandon();
                        return SessionEnd::PeerClosed;
                    };
                    if let Err(err) = self.on_inbound(text).await {
                        if let Some(end) = self.end_after(err).await {
                            return end;
                        }
                    }
                }

                event = next_loop_event(&mut self.run) => {
                    if let Err(err) = self.on_loop_event(event).await {
                        if let Some(end) = self.end_after(err).await {
                            return end;
                        }
                    }
                }
            }
        }
    }
}

/// Next event of the running loop; pending forever when there is none.
async fn next_loop_event(run: &mut Option<LoopRun>) -> Option<LoopEvent> {
    match run {
        Some(run) => run.next().await,
        None => std::future::pending().await,
    }
}
