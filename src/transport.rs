//! Push-channel transport.
//!
//! [`Transport`] is the seam between the connection manager and the network.
//! [`WebSocketTransport`] opens a WebSocket to the hub, performs the protocol
//! handshake, and exposes the connection as a sink/stream pair of
//! [`HubMessage`]s. Tests substitute an in-memory transport.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{future, stream, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::HubError;
use crate::protocol::{self, HubMessage};

/// Outgoing half of an open channel.
pub type FrameSink = Pin<Box<dyn Sink<HubMessage, Error = HubError> + Send>>;

/// Incoming half of an open channel. Ends when the server closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<HubMessage, HubError>> + Send>>;

/// An open, handshaken hub connection.
pub struct Channel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens hub connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect and complete the handshake, authenticating with `token`.
    async fn open(&self, token: &str) -> Result<Channel, HubError>;
}

/// WebSocket transport speaking the JSON hub protocol.
pub struct WebSocketTransport {
    hub_url: String,
    handshake_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            handshake_timeout: Duration::from_secs(15),
        }
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, token: &str) -> Result<Channel, HubError> {
        let url = build_ws_url(&self.hub_url, token)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(connect_error)?;
        let (mut ws_sink, mut ws_reader) = ws_stream.split();

        ws_sink
            .send(Message::Text(protocol::handshake_request()))
            .await
            .map_err(|e| HubError::Transport(format!("handshake send failed: {e}")))?;

        let response = tokio::time::timeout(self.handshake_timeout, next_text(&mut ws_reader))
            .await
            .map_err(|_| HubError::Transport("handshake timed out".into()))??;
        let leftover = protocol::parse_handshake_response(&response)
            .map_err(|e| HubError::Transport(format!("handshake rejected: {e}")))?;

        let initial = stream::iter(decode_records(leftover));
        let incoming = ws_reader.flat_map(|msg| {
            let items = match msg {
                Ok(Message::Text(text)) => decode_records(&text),
                Ok(_) => Vec::new(),
                Err(e) => vec![Err(HubError::Transport(e.to_string()))],
            };
            stream::iter(items)
        });

        let sink = ws_sink
            .with(|msg: HubMessage| {
                future::ready(Ok::<_, tungstenite::Error>(Message::Text(protocol::encode(
                    &msg,
                ))))
            })
            .sink_map_err(|e| HubError::Transport(e.to_string()));

        Ok(Channel {
            sink: Box::pin(sink),
            stream: Box::pin(initial.chain(incoming)),
        })
    }
}

/// Decode a text frame, dropping (and logging) records that fail to parse.
fn decode_records(text: &str) -> Vec<Result<HubMessage, HubError>> {
    protocol::decode_frame(text)
        .into_iter()
        .filter_map(|record| match record {
            Ok(msg) => Some(Ok(msg)),
            Err(e) => {
                tracing::warn!("dropping malformed hub record: {e}");
                None
            }
        })
        .collect()
}

async fn next_text<S>(reader: &mut S) -> Result<String, HubError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(HubError::Transport("closed during handshake".into()))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(HubError::Transport(e.to_string())),
        }
    }
}

fn connect_error(e: tungstenite::Error) -> HubError {
    match &e {
        tungstenite::Error::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
            HubError::Auth(format!("hub rejected token (HTTP {})", resp.status()))
        }
        _ => HubError::Transport(format!("WebSocket connect failed: {e}")),
    }
}

/// Build the WebSocket URL from the HTTP hub URL, carrying the token as
/// `access_token` (browsers and most proxies can't set headers on upgrades).
pub fn build_ws_url(hub_url: &str, token: &str) -> Result<reqwest::Url, HubError> {
    let base = hub_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(HubError::Transport(format!("invalid hub URL scheme: {base}")));
    };
    let mut url = reqwest::Url::parse(&ws_base)
        .map_err(|e| HubError::Transport(format!("invalid hub URL: {e}")))?;
    url.query_pairs_mut().append_pair("access_token", token);
    Ok(url)
}
