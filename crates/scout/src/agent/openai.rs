//! Agent loop over an OpenAI-compatible chat completions endpoint.
//!
//! Each step streams one completion over SSE. Content deltas are forwarded as
//! they arrive; tool-call deltas are accumulated and executed after the
//! stream ends. Only the first tool call of a step is honoured. In
//! autonomous mode the top links of a search are queued and read with forced
//! `parse_website` calls, made without a model round trip, before the model
//! gets to answer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest_eventsource::{Event as SseEvent, EventSource};
use scout_protocol::ToolArgs;
use scout_protocol::tools::{PARSE_WEBSITE, WEB_SEARCH};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::tools::{ToolBox, ToolError};
use super::{AgentLoop, LOOP_EVENT_BUFFER, LoopEmitter, LoopError, LoopEvent, LoopRun, ModelCatalog};

/// Tool-call slots tracked per step; deltas with a higher index are dropped.
const MAX_TOOL_CALLS: usize = 16;

const SYSTEM_PROMPT: &str = "\
You are a research agent. Answer the user's question using the web_search and \
parse_website tools. Every statement in your answer must cite its source URL, \
for example \"(Source: https://example.com/page)\". Combine facts from the same \
source into one sentence. If you cannot cite something, leave it out. Use the \
function calling interface directly; never write tool calls or announce tool use \
in your answer text.";

/// Settings for [`OpenAiLoop`].
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
    /// Allowed model ids; empty allows any.
    pub models: Vec<String>,
    pub max_steps: usize,
    pub autonomous: bool,
    pub follow_up_urls: usize,
    pub request_timeout: Duration,
}

impl OpenAiConfig {
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn resolve_model(&self, requested: Option<&str>) -> Result<String, LoopError> {
        let model = requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model);
        if model.is_empty() {
            return Err(LoopError::NotConfigured("no default model".to_string()));
        }
        if !self.models.is_empty() && !self.models.iter().any(|m| m == model) {
            return Err(LoopError::ModelUnavailable(model.to_string()));
        }
        Ok(model.to_string())
    }
}

/// Agent loop backed by streaming chat completions.
#[derive(Clone)]
pub struct OpenAiLoop {
    client: reqwest::Client,
    config: Arc<OpenAiConfig>,
    tools: Arc<ToolBox>,
}

impl OpenAiLoop {
    pub fn new(config: OpenAiConfig, tools: ToolBox) -> Result<Self, LoopError> {
        if config.base_url.trim().is_empty() {
            return Err(LoopError::NotConfigured("agent.base_url is empty".to_string()));
        }
        // Completions stream for as long as the model writes; only a silent
        // connection times out.
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .read_timeout(config.request_timeout)
            .build()
            .map_err(|e| LoopError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            config: Arc::new(config),
            tools: Arc::new(tools),
        })
    }
}

#[async_trait]
impl AgentLoop for OpenAiLoop {
    async fn start(&self, query: &str, model: Option<&str>) -> Result<LoopRun, LoopError> {
        let model = self.config.resolve_model(model)?;
        let (run, emitter) = LoopRun::channel(LOOP_EVENT_BUFFER);

        let turn = Turn {
            client: self.client.clone(),
            config: self.config.clone(),
            tools: self.tools.clone(),
            model,
            emitter,
        };
        let query = query.to_string();
        tokio::spawn(async move { turn.run(query).await });

        Ok(run)
    }
}

/// A tool call assembled from streamed deltas.
#[derive(Debug, Clone, Default, PartialEq)]
struct ToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCall {
    fn args(&self) -> ToolArgs {
        serde_json::from_str::<Map<String, Value>>(&self.arguments).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct StepOutput {
    content: String,
    tool_calls: Vec<ToolCall>,
}

enum StepError {
    Stopped,
    Failed(String),
}

/// Joins content across tool calls: the first chunk after a tool call is
/// separated from earlier content by a blank line.
#[derive(Debug, Default)]
struct ContentJoiner {
    wrote_content: bool,
    after_tool: bool,
}

impl ContentJoiner {
    fn next(&mut self, chunk: &str) -> String {
        let text = if self.after_tool && self.wrote_content {
            format!("\n\n{chunk}")
        } else {
            chunk.to_string()
        };
        self.after_tool = false;
        self.wrote_content = true;
        text
    }

    fn tool_called(&mut self) {
        self.after_tool = true;
    }
}

struct Turn {
    client: reqwest::Client,
    config: Arc<OpenAiConfig>,
    tools: Arc<ToolBox>,
    model: String,
    emitter: LoopEmitter,
}

impl Turn {
    async fn run(self, query: String) {
        let mut messages = vec![
            json!({"role": "system", "content": SYSTEM_PROMPT}),
            json!({"role": "user", "content": query}),
        ];
        let mut pending_urls: VecDeque<String> = VecDeque::new();
        let mut joiner = ContentJoiner::default();

        for step in 0..self.config.max_steps {
            let forced_url = if self.config.autonomous {
                pending_urls.pop_front()
            } else {
                None
            };

            let forced = forced_url.is_some();
            // Queued sources are read without consulting the model.
            let (content, call) = match forced_url {
                Some(url) => {
                    debug!("step {step}: reading queued source {url}");
                    let call = ToolCall {
                        id: format!("forced_{step}"),
                        name: PARSE_WEBSITE.to_string(),
                        arguments: json!({ "url": url }).to_string(),
                    };
                    (String::new(), Some(call))
                }
                None => {
                    debug!("step {step} with model {}", self.model);
                    let output = match self.stream_step(&messages, &mut joiner).await {
                        Ok(output) => output,
                        Err(StepError::Stopped) => {
                            debug!("turn stopped during step {step}");
                            return;
                        }
                        Err(StepError::Failed(reason)) => {
                            warn!("model step failed: {reason}");
                            self.emitter.emit(LoopEvent::failed(reason)).await;
                            return;
                        }
                    };
                    (output.content, first_named_call(output.tool_calls))
                }
            };

            let Some(mut call) = call else {
                self.emitter.emit(LoopEvent::Completed).await;
                return;
            };

            if call.id.is_empty() {
                call.id = format!("call_{step}");
            }
            messages.push(json!({
                "role": "assistant",
                "content": content,
                "tool_calls": [{
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments}
                }]
            }));

            let args = call.args();
            if !self
                .emitter
                .emit(LoopEvent::tool_invoked(&call.name, args.clone()))
                .await
            {
                return;
            }
            let result = tokio::select! {
                _ = self.emitter.stopped() => return,
                result = self.tools.invoke(&call.name, &args) => result,
            };
            if !self.emitter.emit(LoopEvent::tool_completed(&call.name)).await {
                return;
            }
            joiner.tool_called();

            let tool_output = match result {
                Ok(value) => {
                    if call.name == WEB_SEARCH && self.config.autonomous {
                        pending_urls = follow_up_links(&value, self.config.follow_up_urls);
                        info!("queued {} follow-up source(s)", pending_urls.len());
                    }
                    value
                }
                Err(err) => tool_failure(&call, &err),
            };
            messages.push(json!({
                "role": "tool",
                "tool_call_id": call.id,
                "name": call.name,
                "content": tool_output.to_string(),
            }));

            if forced && pending_urls.is_empty() {
                messages.push(json!({
                    "role": "user",
                    "content": "All queued sources have been read. Compile the answer now, citing each source.",
                }));
            }
        }

        self.emitter
            .emit(LoopEvent::failed(format!(
                "The agent stopped after {} steps without finishing.",
                self.config.max_steps
            )))
            .await;
    }

    async fn stream_step(
        &self,
        messages: &[Value],
        joiner: &mut ContentJoiner,
    ) -> Result<StepOutput, StepError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "tools": ToolBox::definitions(),
            "stream": true,
        });

        let mut request = self
            .client
            .post(self.config.endpoint("chat/completions"))
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let mut es = EventSource::new(request)
            .map_err(|e| StepError::Failed(format!("cannot build model request: {e}")))?;
        let mut output = StepOutput::default();

        loop {
            let next = tokio::select! {
                _ = self.emitter.stopped() => {
                    es.close();
                    return Err(StepError::Stopped);
                }
                next = es.next() => next,
            };
            let Some(event) = next else {
                break;
            };

            match event {
                Ok(SseEvent::Open) => {}
                Ok(SseEvent::Message(msg)) => {
                    if msg.data.trim() == "[DONE]" {
                        es.close();
                        break;
                    }
                    let chunk: CompletionChunk = match serde_json::from_str(&msg.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            debug!("skipping unparseable completion chunk: {e}");
                            continue;
                        }
                    };
                    for choice in chunk.choices {
                        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                            output.content.push_str(&text);
                            if !self.emitter.emit(LoopEvent::chunk(joiner.next(&text))).await {
                                es.close();
                                return Err(StepError::Stopped);
                            }
                        }
                        for delta in choice.delta.tool_calls {
                            merge_tool_delta(&mut output.tool_calls, delta);
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, _)) => {
                    es.close();
                    return Err(StepError::Failed(format!(
                        "The model endpoint returned status {status}."
                    )));
                }
                Err(e) => {
                    es.close();
                    return Err(StepError::Failed(format!("The model stream failed: {e}")));
                }
            }
        }

        Ok(output)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn merge_tool_delta(calls: &mut Vec<ToolCall>, delta: ToolCallDelta) {
    if delta.index >= MAX_TOOL_CALLS {
        debug!("dropping tool call delta with index {}", delta.index);
        return;
    }
    if calls.len() <= delta.index {
        calls.resize_with(delta.index + 1, ToolCall::default);
    }
    let call = &mut calls[delta.index];
    if let Some(id) = delta.id {
        call.id = id;
    }
    if let Some(function) = delta.function {
        if let Some(name) = function.name {
            call.name.push_str(&name);
        }
        if let Some(arguments) = function.arguments {
            call.arguments.push_str(&arguments);
        }
    }
}

/// The call to execute this step: the first one that names a tool.
fn first_named_call(calls: Vec<ToolCall>) -> Option<ToolCall> {
    let mut named = calls.into_iter().filter(|call| !call.name.is_empty());
    let first = named.next();
    let extra = named.count();
    if extra > 0 {
        warn!("{} tool calls in one step, keeping the first", extra + 1);
    }
    first
}

/// Links of the top search results, in rank order.
fn follow_up_links(results: &Value, limit: usize) -> VecDeque<String> {
    results
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("link").and_then(Value::as_str))
                .filter(|link| link.starts_with("http"))
                .take(limit)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn tool_failure(call: &ToolCall, err: &ToolError) -> Value {
    warn!("tool {} failed: {err}", call.name);
    let mut output = json!({ "error": err.to_string() });
    if let Some(url) = call.args().get("url") {
        output["url"] = url.clone();
    }
    output
}

/// Model listing from `GET {base_url}/models`.
#[derive(Clone)]
pub struct OpenAiCatalog {
    client: reqwest::Client,
    config: Arc<OpenAiConfig>,
}

impl OpenAiCatalog {
    pub fn new(config: OpenAiConfig) -> Result<Self, LoopError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LoopError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    fn fallback(&self) -> Vec<String> {
        if self.config.models.is_empty() {
            vec![self.config.default_model.clone()]
        } else {
            self.config.models.clone()
        }
    }

    async fn fetch(&self) -> Result<Vec<String>, reqwest::Error> {
        #[derive(Deserialize)]
        struct ModelList {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let mut request = self.client.get(self.config.endpoint("models"));
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }
        let list: ModelList = request.send().await?.error_for_status()?.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl ModelCatalog for OpenAiCatalog {
    async fn list_models(&self) -> Vec<String> {
        match self.fetch().await {
            Ok(mut models) => {
                if !self.config.models.is_empty() {
                    models.retain(|m| self.config.models.contains(m));
                }
                if models.is_empty() {
                    return self.fallback();
                }
                models
            }
            Err(e) => {
                warn!("listing models failed, using configured models: {e}");
                self.fallback()
            }
        }
    }

    fn default_model(&self) -> Option<String> {
        Some(self.config.default_model.clone()).filter(|m| !m.is_empty())
    }
}
