//! WebSocket client for agent channels.
//!
//! [`ChannelClient`] sends one query per turn and folds the server's events
//! into a [`TurnView`], reporting each [`TurnUpdate`] to the caller.

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use scout_protocol::{Decoded, TurnUpdate, TurnView, decode};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("a response is still in progress on this channel")]
    TurnInProgress,

    #[error("channel closed by server{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed(Option<String>),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// `end_response` arrived; the full response text.
    Completed(String),
    /// `error` arrived; the server's message.
    Failed(String),
}

/// Model listing as served by `GET /api/models`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelList {
    pub models: Vec<String>,
    pub default: Option<String>,
}

/// Build the channel URL for a server base URL (`ws://`, `wss://`,
/// `http://` or `https://`).
pub fn channel_url(server: &str, model: Option<&str>) -> Result<String, ClientError> {
    let base = server.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(ClientError::InvalidUrl(server.to_string()));
    };

    let mut url = format!("{base}/ws");
    if let Some(model) = model {
        url.push_str("?model=");
        url.push_str(&urlencoding::encode(model));
    }
    Ok(url)
}

/// Build the HTTP base URL for a server base URL.
pub fn http_url(server: &str) -> Result<String, ClientError> {
    let base = server.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("ws://") {
        Ok(format!("http://{rest}"))
    } else if let Some(rest) = base.strip_prefix("wss://") {
        Ok(format!("https://{rest}"))
    } else if base.starts_with("http://") || base.starts_with("https://") {
        Ok(base.to_string())
    } else {
        Err(ClientError::InvalidUrl(server.to_string()))
    }
}

/// Fetch the server's model list.
pub async fn fetch_models(server: &str) -> Result<ModelList, ClientError> {
    let url = format!("{}/api/models", http_url(server)?);
    let list = reqwest::get(&url)
        .await?
        .error_for_status()?
        .json::<ModelList>()
        .await?;
    Ok(list)
}

/// One open channel.
pub struct ChannelClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    view: TurnView,
}

impl ChannelClient {
    /// Open a channel on `server`, optionally selecting a model.
    pub async fn connect(server: &str, model: Option<&str>) -> Result<Self, ClientError> {
        let url = channel_url(server, model)?;
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|source| ClientError::Connect {
                url: url.clone(),
                source,
            })?;
        debug!("connected to {url}");
        Ok(Self {
            socket,
            view: TurnView::new(),
        })
    }

    pub fn view(&self) -> &TurnView {
        &self.view
    }

    /// Send a query without waiting for its events. Refused while the
    /// previous turn has not ended.
    pub async fn send_query(&mut self, query: &str) -> Result<(), ClientError> {
        if !self.view.input_enabled() {
            return Err(ClientError::TurnInProgress);
        }
        self.view.submit();
        self.socket.send(Message::text(query.to_string())).await?;
        Ok(())
    }

    /// Receive the next decodable frame and apply it to the view.
    /// Undecodable frames are logged and skipped. Returns `Ok(None)` once the
    /// channel is closed.
    pub async fn recv(&mut self) -> Result<Option<Decoded>, ClientError> {
        match self.next_frame().await? {
            Frame::Decoded(decoded) => {
                self.view.apply_decoded(decoded.clone());
                Ok(Some(decoded))
            }
            Frame::Closed(_) => Ok(None),
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, ClientError> {
        while let Some(msg) = self.socket.next().await {
            match msg? {
                Message::Text(text) => match decode(text.as_str()) {
                    Ok(decoded) => return Ok(Frame::Decoded(decoded)),
                    Err(e) => warn!("ignoring undecodable frame: {e}"),
                },
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                    return Ok(Frame::Closed(reason));
                }
                _ => {}
            }
        }
        Ok(Frame::Closed(None))
    }

    /// Run one turn: send `query`, then apply events until the turn ends.
    /// `on_update` sees every change along with the view after it.
    pub async fn ask<F>(&mut self, query: &str, mut on_update: F) -> Result<TurnOutcome, ClientError>
    where
        F: FnMut(&TurnView, &TurnUpdate),
    {
        self.send_query(query).await?;

        loop {
            let decoded = match self.next_frame().await? {
                Frame::Decoded(decoded) => decoded,
                Frame::Closed(reason) => return Err(ClientError::Closed(reason)),
            };
            if let Decoded::Unrecognized { kind } = &decoded {
                debug!("ignoring event of unknown kind '{kind}'");
            }

            let update = self.view.apply_decoded(decoded);
            on_update(&self.view, &update);
            match update {
                TurnUpdate::Completed => {
                    return Ok(TurnOutcome::Completed(self.view.text().to_string()));
                }
                TurnUpdate::Failed(message) => return Ok(TurnOutcome::Failed(message)),
                _ => {}
            }
        }
    }

    /// Close the channel, which also cancels any turn in progress.
    pub async fn close(mut self) -> Result<(), ClientError> {
        match self.socket.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

enum Frame {
    Decoded(Decoded),
    Closed(Option<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_url() {
        assert_eq!(
            channel_url("ws://localhost:8000/", None).unwrap(),
            "ws://localhost:8000/ws"
        );
        assert_eq!(
            channel_url("http://localhost:8000", Some("gpt 4o")).unwrap(),
            "ws://localhost:8000/ws?model=gpt%204o"
        );
        assert_eq!(
            channel_url("https://scout.example", None).unwrap(),
            "wss://scout.example/ws"
        );
        assert!(matches!(
            channel_url("localhost:8000", None),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_http_url() {
        assert_eq!(http_url("ws://127.0.0.1:8000").unwrap(), "http://127.0.0.1:8000");
        assert_eq!(http_url("wss://h/").unwrap(), "https://h");
        assert_eq!(http_url("http://h").unwrap(), "http://h");
        assert!(http_url("ftp://h").is_err());
    }

    #[test]
    fn test_closed_message() {
        assert_eq!(
            ClientError::Closed(Some("bye".into())).to_string(),
            "channel closed by server: bye"
        );
        assert_eq!(ClientError::Closed(None).to_string(), "channel closed by server");
    }
}
