//! WebSocket handler for agent channels.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ConnectInfo, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use scout_protocol::encode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::api::AppState;
use crate::session::{Outbound, SessionEnd};

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// Queued frames per channel before the session waits on the writer.
const OUTBOUND_BUFFER: usize = 64;

/// Queued client queries per channel.
const INBOUND_BUFFER: usize = 16;

/// How long teardown waits for queued frames to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
pub struct ChannelParams {
    /// Model to run for this channel; the server default when absent.
    pub model: Option<String>,
}

/// WebSocket upgrade handler.
///
/// GET /ws?model=<id>
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ChannelParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let model = params.model.filter(|m| !m.trim().is_empty());
    info!(
        "channel upgrade from {addr} (model: {})",
        model.as_deref().unwrap_or("default")
    );
    ws.on_upgrade(move |socket| handle_channel(socket, state, model, addr))
}

/// Run one channel: a writer task draining the session's outbound queue,
/// a reader task feeding text frames to the session, and the session itself
/// on this task.
async fn handle_channel(
    socket: WebSocket,
    state: AppState,
    model: Option<String>,
    addr: SocketAddr,
) {
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

    let session = state
        .sessions
        .create(model, state.agent.clone(), outbound_tx)
        .with_admission(state.admission.clone(), addr.ip());
    let session_id = session.id();

    let mut writer = tokio::spawn(write_frames(sink, outbound_rx, session_id));
    let reader = tokio::spawn(read_frames(stream, inbound_tx, session_id));

    let end = session.drive(ReceiverStream::new(inbound_rx)).await;
    state.sessions.remove(session_id);
    reader.abort();

    match end {
        SessionEnd::Cancelled => info!("channel {session_id} closed by server"),
        SessionEnd::PeerClosed => info!("channel {session_id} closed by peer"),
        SessionEnd::ChannelLost => warn!("channel {session_id} lost"),
    }

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!("channel {session_id}: writer did not drain in time");
        writer.abort();
    }
}

/// Write queued events to the socket in order, with periodic pings.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    session_id: Uuid,
) {
    let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    // The first tick completes immediately.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Event(event)) => {
                    let frame = match encode(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("channel {session_id}: failed to encode {:?}: {e}", event.kind());
                            continue;
                        }
                    };
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        debug!("channel {session_id}: send failed, stopping writer");
                        break;
                    }
                }
                Some(Outbound::Close { reason }) => {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },

            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!("channel {session_id}: ping failed, stopping writer");
                    break;
                }
            }
        }
    }
}

/// Forward text frames to the session. Returning drops `inbound`, which the
/// session reads as the peer leaving.
async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    inbound: mpsc::Sender<String>,
    session_id: Uuid,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if inbound.send(text.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("channel {session_id}: ignoring binary frame");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("channel {session_id}: close frame received");
                break;
            }
            Err(e) => {
                warn!("channel {session_id}: websocket error: {e}");
                break;
            }
        }
    }
}
