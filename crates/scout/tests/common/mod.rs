//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use scout::admission::Admission;
use scout::agent::{ScriptedLoop, StaticCatalog};
use scout::api::{self, AppState};
use futures::{SinkExt, StreamExt};
use scout_protocol::{Decoded, Event, decode};
use serde_json::{Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub const DEFAULT_MODEL: &str = "test-model";
pub const OTHER_MODEL: &str = "other-model";

/// Isolated state: its own registry, a scripted agent loop and no limits.
pub fn test_state(agent: ScriptedLoop) -> AppState {
    test_state_with(agent, Admission::unlimited())
}

pub fn test_state_with(agent: ScriptedLoop, admission: Admission) -> AppState {
    AppState::new(
        Arc::new(agent),
        Arc::new(StaticCatalog::new([DEFAULT_MODEL, OTHER_MODEL])),
        admission,
    )
}

/// Router for oneshot HTTP tests.
pub fn test_app() -> Router {
    api::create_router(test_state(ScriptedLoop::new(vec![])))
}

/// A server running on an ephemeral port. Stopped on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.sessions.cancel_all();
        self.handle.abort();
    }
}

pub async fn spawn_server(state: AppState) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("Failed to read local addr");
    let app = api::create_router(state.clone());

    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("test server failed");
    });

    TestServer {
        addr,
        state,
        handle,
    }
}

/// A channel socket without client-side turn bookkeeping.
pub struct RawChannel {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawChannel {
    pub async fn connect(server: &TestServer) -> Self {
        let (socket, _) = connect_async(format!("{}/ws", server.ws_url()))
            .await
            .expect("Failed to open channel");
        Self { socket }
    }

    pub async fn send(&mut self, text: &str) {
        self.socket
            .send(Message::text(text.to_string()))
            .await
            .expect("Failed to send frame");
    }

    /// Next protocol event, waiting at most five seconds.
    pub async fn next_event(&mut self) -> Event {
        let next = async {
            while let Some(msg) = self.socket.next().await {
                let Message::Text(text) = msg.expect("websocket error") else {
                    continue;
                };
                if let Ok(Decoded::Event(event)) = decode(text.as_str()) {
                    return event;
                }
            }
            panic!("channel closed while waiting for an event");
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), next)
            .await
            .expect("timed out waiting for an event")
    }
}

/// Tool arguments from a JSON object literal.
pub fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("args must be a JSON object")
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}
