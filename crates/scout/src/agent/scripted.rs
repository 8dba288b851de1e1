//! Deterministic agent loops.
//!
//! [`ScriptedLoop`] replays a fixed list of steps for every query. It backs
//! the `echo` provider (offline demos, smoke tests) and the test suites.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::json;

use super::{AgentLoop, LOOP_EVENT_BUFFER, LoopEmitter, LoopError, LoopEvent, LoopRun, ModelCatalog};

/// Model id advertised by the echo provider.
pub const ECHO_MODEL: &str = "echo";

/// One step of a loop script.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(LoopEvent),
    Pause(Duration),
    /// Wait until stopped without producing anything else.
    Stall,
}

#[derive(Debug, Clone)]
enum Mode {
    Script(Vec<ScriptStep>),
    Echo { delay: Duration },
    FailStart(LoopError),
}

/// Agent loop that replays a script.
#[derive(Debug, Clone)]
pub struct ScriptedLoop {
    mode: Mode,
    started: Arc<Mutex<Vec<(String, Option<String>)>>>,
    stops_observed: Arc<AtomicUsize>,
}

impl ScriptedLoop {
    /// Replay `steps` for every query. A script that ends without a terminal
    /// event closes the run early.
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::with_mode(Mode::Script(steps))
    }

    /// Convenience for scripts made only of events.
    pub fn from_events(events: impl IntoIterator<Item = LoopEvent>) -> Self {
        Self::new(events.into_iter().map(ScriptStep::Emit).collect())
    }

    /// Announce a search for the query, then stream it back word by word.
    pub fn echo(delay: Duration) -> Self {
        Self::with_mode(Mode::Echo { delay })
    }

    /// Refuse to start.
    pub fn failing(error: LoopError) -> Self {
        Self::with_mode(Mode::FailStart(error))
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            started: Arc::new(Mutex::new(Vec::new())),
            stops_observed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queries and models this loop was started with, in order.
    pub fn started(&self) -> Vec<(String, Option<String>)> {
        self.started
            .lock()
            .map(|started| started.clone())
            .unwrap_or_default()
    }

    /// How many runs noticed a stop request before finishing their script.
    pub fn stops_observed(&self) -> usize {
        self.stops_observed.load(Ordering::SeqCst)
    }

    fn echo_steps(query: &str, delay: Duration) -> Vec<ScriptStep> {
        let args = json!({ "query": query, "max_results": 5 });
        let mut steps = vec![
            ScriptStep::Emit(LoopEvent::tool_invoked(
                "web_search",
                args.as_object().cloned().unwrap_or_default(),
            )),
            ScriptStep::Pause(delay),
            ScriptStep::Emit(LoopEvent::tool_completed("web_search")),
        ];

        let answer = format!("You asked: {query}");
        let words: Vec<&str> = answer.split(' ').collect();
        for (idx, word) in words.iter().enumerate() {
            let text = if idx + 1 < words.len() {
                format!("{word} ")
            } else {
                (*word).to_string()
            };
            steps.push(ScriptStep::Pause(delay));
            steps.push(ScriptStep::Emit(LoopEvent::chunk(text)));
        }
        steps.push(ScriptStep::Emit(LoopEvent::Completed));
        steps
    }
}

#[async_trait]
impl AgentLoop for ScriptedLoop {
    async fn start(&self, query: &str, model: Option<&str>) -> Result<LoopRun, LoopError> {
        if let Ok(mut started) = self.started.lock() {
            started.push((query.to_string(), model.map(str::to_string)));
        }

        let steps = match &self.mode {
            Mode::FailStart(err) => return Err(err.clone()),
            Mode::Script(steps) => steps.clone(),
            Mode::Echo { delay } => Self::echo_steps(query, *delay),
        };

        let (run, emitter) = LoopRun::channel(LOOP_EVENT_BUFFER);
        let stops = self.stops_observed.clone();
        tokio::spawn(async move {
            if !play(steps, &emitter).await {
                stops.fetch_add(1, Ordering::SeqCst);
                debug!("scripted loop stopped early");
            }
        });
        Ok(run)
    }
}

/// Play a script. Returns `false` if the run was stopped first.
async fn play(steps: Vec<ScriptStep>, emitter: &LoopEmitter) -> bool {
    for step in steps {
        match step {
            ScriptStep::Emit(event) => {
                if !emitter.emit(event).await {
                    return false;
                }
            }
            ScriptStep::Pause(delay) => {
                tokio::select! {
                    _ = emitter.stopped() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            ScriptStep::Stall => {
                emitter.stopped().await;
                return false;
            }
        }
    }
    true
}

/// Model catalog backed by a fixed list. The first entry is the default.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    models: Vec<String>,
}

impl StaticCatalog {
    pub fn new(models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            models: models.into_iter().map(Into::into).collect(),
        }
    }

    pub fn echo() -> Self {
        Self::new([ECHO_MODEL])
    }
}

#[async_trait]
impl ModelCatalog for StaticCatalog {
    async fn list_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn default_model(&self) -> Option<String> {
        self.models.first().cloned()
    }
}
