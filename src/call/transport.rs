//! Connections to the remote conversational agent

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::protocol::{self, InboundEvent, OutboundMessage, SessionSetup};
use crate::{Error, Result};

/// Frames buffered in each direction before senders see backpressure
const CHANNEL_CAPACITY: usize = 64;

/// A live agent connection as a pair of channels
///
/// Dropping the connection closes the socket.
pub struct AgentConnection {
    /// Media toward the agent
    pub outbound: mpsc::Sender<OutboundMessage>,
    /// Events from the agent; ends with `Closed` or `Failed`
    pub inbound: mpsc::Receiver<InboundEvent>,
}

impl AgentConnection {
    /// Build a connection and hand back the far ends of its channels
    #[must_use]
    pub fn pair() -> (Self, mpsc::Receiver<OutboundMessage>, mpsc::Sender<InboundEvent>) {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

/// Opens agent connections
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Connect and send the session setup
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionConnection` if the agent cannot be reached
    async fn connect(&self, setup: &SessionSetup) -> Result<AgentConnection>;
}

/// Agent transport over a WebSocket
pub struct WebSocketTransport {
    url: Url,
    api_key: SecretString,
}

impl WebSocketTransport {
    /// Create a transport for `url`; the key is passed as a `key` query parameter
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or not a WebSocket URL
    pub fn new(url: &str, api_key: SecretString) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("invalid agent URL: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "agent URL must use ws or wss, got {}",
                url.scheme()
            )));
        }
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("agent API key required".to_string()));
        }
        Ok(Self { url, api_key })
    }

    fn authorized_url(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("key", self.api_key.expose_secret());
        url
    }
}

#[async_trait]
impl AgentTransport for WebSocketTransport {
    async fn connect(&self, setup: &SessionSetup) -> Result<AgentConnection> {
        tracing::info!(host = ?self.url.host_str(), model = %setup.model, "connecting to agent");

        let (socket, _) = connect_async(self.authorized_url().as_str())
            .await
            .map_err(|e| Error::SessionConnection(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let setup_json = OutboundMessage::Setup(setup.clone()).to_json()?;
        sink.send(Message::Text(setup_json))
            .await
            .map_err(|e| Error::SessionConnection(format!("setup failed: {e}")))?;

        let (connection, mut out_rx, in_tx) = AgentConnection::pair();

        // Writer: ends when every outbound sender is gone
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unserializable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    tracing::debug!(error = %e, "agent socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            tracing::debug!("agent writer finished");
        });

        // Reader: always finishes with Closed or Failed
        tokio::spawn(async move {
            let mut end = InboundEvent::Failed("connection lost".to_string());
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::trace!("ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        end = InboundEvent::Closed(frame.map(|f| f.reason.to_string()));
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "agent socket error");
                        end = InboundEvent::Failed(e.to_string());
                        break;
                    }
                };

                match protocol::parse_server_message(&text) {
                    Ok(events) => {
                        for event in events {
                            if in_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "ignoring malformed agent frame"),
                }
            }
            tracing::info!(end = ?end, "agent connection finished");
            let _ = in_tx.send(end).await;
        });

        Ok(connection)
    }
}
