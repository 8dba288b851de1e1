//! Process-wide set of open sessions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::info;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{AgentSession, Outbound, Phase};
use crate::agent::AgentLoop;

/// Registry-side view of a session: enough to observe and cancel it, never
/// to mutate its turn state.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    model: Option<String>,
    phase: watch::Receiver<Phase>,
    cancel: CancellationToken,
    opened_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Request cancellation. The owning session closes its channel.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            model: self.model.clone(),
            phase: self.phase(),
            opened_at: self.opened_at,
        }
    }
}

/// Serializable summary of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub model: Option<String>,
    pub phase: Phase,
    pub opened_at: DateTime<Utc>,
}

/// Set of active sessions, keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session writing to `outbound` and register it.
    pub fn create(
        &self,
        model: Option<String>,
        agent: Arc<dyn AgentLoop>,
        outbound: mpsc::Sender<Outbound>,
    ) -> AgentSession {
        let id = Uuid::new_v4();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let cancel = CancellationToken::new();

        let handle = SessionHandle {
            id,
            model: model.clone(),
            phase: phase_rx,
            cancel: cancel.clone(),
            opened_at: Utc::now(),
        };
        self.sessions.insert(id, handle);
        info!(
            "session {id} opened (model: {})",
            model.as_deref().unwrap_or("default")
        );

        AgentSession::new(id, model, agent, outbound, phase_tx, cancel)
    }

    /// Evict a session, returning its handle for teardown.
    pub fn remove(&self, id: Uuid) -> Option<SessionHandle> {
        let removed = self.sessions.remove(&id).map(|(_, handle)| handle);
        if removed.is_some() {
            info!("session {id} closed");
        }
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Cancel one session. Returns `false` if it is not registered.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.sessions.get(&id) {
            Some(entry) => {
                entry.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered session. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.sessions.iter() {
            entry.cancel();
            count += 1;
        }
        count
    }

    /// Summaries of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.iter().map(|e| e.info()).collect();
        infos.sort_by_key(|info| info.opened_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
