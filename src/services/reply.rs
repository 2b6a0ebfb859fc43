//! Streamed reply generation
//!
//! Replies arrive as a stream of text deltas so speech can start on the first
//! clause. The HTTP client speaks the server-sent-events dialect of
//! chat-completion APIs (`data: {...}` lines ending with `data: [DONE]`).

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest silence between streamed chunks
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Incrementally arriving reply text
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Generates conversational replies
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Start generating a reply to `prompt`
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` on quota exhaustion or error if the request fails
    async fn generate(&self, prompt: &str) -> Result<TextStream>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Reply generator backed by a streaming chat-completion endpoint
pub struct HttpReplyGenerator {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
    model: String,
    system_instruction: String,
}

impl HttpReplyGenerator {
    /// Create a generator; without a key every request fails with
    /// `Error::MissingApiKey`
    #[must_use]
    pub fn new(
        url: String,
        api_key: Option<SecretString>,
        model: String,
        system_instruction: String,
    ) -> Self {
        let api_key = api_key.filter(|k| !k.expose_secret().trim().is_empty());
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .read_timeout(READ_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url,
            api_key,
            model,
            system_instruction,
        }
    }
}

#[async_trait]
impl ReplyGenerator for HttpReplyGenerator {
    async fn generate(&self, prompt: &str) -> Result<TextStream> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::MissingApiKey("OPENAI_API_KEY".to_string()))?;
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &self.system_instruction,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            stream: true,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Busy(format!("reply service unreachable: {e}")))?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
        ) {
            return Err(Error::Busy(format!("reply service returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "reply service error");
            return Err(Error::Intent(format!("reply service error {status}: {body}")));
        }
        tracing::debug!("reply stream established");

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                for delta in parser.push(&chunk) {
                    match delta {
                        SseDelta::Text(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        SseDelta::Done => return,
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseDelta {
    Text(String),
    Done,
}

/// Line-buffered parser for `data:` events
///
/// Buffers raw bytes and decodes only complete lines, so a multi-byte
/// character split across network chunks survives intact.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseDelta> {
        self.buffer.extend_from_slice(bytes);
        let mut deltas = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping non-UTF-8 SSE line");
                    continue;
                }
            };
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                deltas.push(SseDelta::Done);
                break;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => deltas.extend(
                    chunk
                        .choices
                        .into_iter()
                        .filter_map(|c| c.delta.content)
                        .filter(|c| !c.is_empty())
                        .map(SseDelta::Text),
                ),
                Err(e) => tracing::debug!(error = %e, data, "skipping unparseable SSE chunk"),
            }
        }

        deltas
    }
}
