//! Application state shared across handlers.

use std::sync::Arc;

use crate::admission::Admission;
use crate::agent::{AgentLoop, ModelCatalog};
use crate::session::SessionRegistry;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Open channels and their sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Agent loop started for every turn.
    pub agent: Arc<dyn AgentLoop>,
    /// Model listing for `/api/models` and the default model.
    pub models: Arc<dyn ModelCatalog>,
    /// Input screening and per-client rate limits.
    pub admission: Arc<Admission>,
    /// Origins allowed by CORS. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        agent: Arc<dyn AgentLoop>,
        models: Arc<dyn ModelCatalog>,
        admission: Admission,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            agent,
            models,
            admission: Arc::new(admission),
            cors_origins: Vec::new(),
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }
}
