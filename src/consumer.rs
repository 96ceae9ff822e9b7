//! Client stream consumer.
//!
//! [`StreamConsumer`] is the synchronous core: bytes in, deltas out, with the
//! per-request state machine
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Completed
//!                    \            \-> Failed
//!                     \-> Failed (empty body)
//! ```
//!
//! [`DeltaStream`] drives a consumer from an async byte stream, and
//! [`ChatClient`] opens that byte stream against a running bridge.

use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::debug;

use crate::codec::{SseDecoder, SseLine};
use crate::config::Timeouts;
use crate::error::ClientError;
use crate::providers::{ChatMessage, ChatRequest, ErrorBody};
use crate::transcript::{drive_reply, Conversation, ReplySink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed(String),
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Completed | ConsumerState::Failed(_))
    }
}

/// Incremental SSE consumer for one request. Not reusable: a retry needs a
/// fresh instance.
#[derive(Debug)]
pub struct StreamConsumer {
    state: ConsumerState,
    decoder: SseDecoder,
    transcript: String,
    deltas: usize,
}

impl Default for StreamConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self {
            state: ConsumerState::Idle,
            decoder: SseDecoder::new(),
            transcript: String::new(),
            deltas: 0,
        }
    }

    /// The request has been issued and its body is about to be read.
    pub fn connect(&mut self) {
        if self.state == ConsumerState::Idle {
            self.state = ConsumerState::Connecting;
        }
    }

    /// Feed raw body bytes; returns the deltas they completed, in order.
    /// Bytes arriving after a terminal state are ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        if self.state.is_terminal() || bytes.is_empty() {
            return Vec::new();
        }
        if matches!(self.state, ConsumerState::Idle | ConsumerState::Connecting) {
            self.state = ConsumerState::Streaming;
        }

        let mut out = Vec::new();
        for line in self.decoder.push(bytes) {
            match line {
                SseLine::Delta(delta) => {
                    self.transcript.push_str(&delta);
                    self.deltas += 1;
                    out.push(delta);
                }
                SseLine::Done => {
                    self.state = ConsumerState::Completed;
                    break;
                }
                SseLine::Ignored => {}
            }
        }
        out
    }

    /// Clean end of the byte stream.
    pub fn finish(&mut self) {
        match self.state {
            ConsumerState::Streaming => self.state = ConsumerState::Completed,
            ConsumerState::Idle | ConsumerState::Connecting => {
                self.state = ConsumerState::Failed("empty response body".to_string())
            }
            ConsumerState::Completed | ConsumerState::Failed(_) => {}
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = ConsumerState::Failed(reason.into());
        }
    }

    pub fn state(&self) -> &ConsumerState {
        &self.state
    }

    /// Concatenation of every delta returned by [`feed`](Self::feed) so far.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn delta_count(&self) -> usize {
        self.deltas
    }
}

// ---------------------------------------------------------------------------
// Async adapter
// ---------------------------------------------------------------------------

/// Lazy, ordered sequence of content deltas read from an SSE byte stream.
pub struct DeltaStream<S> {
    body: S,
    consumer: StreamConsumer,
    queue: VecDeque<String>,
    idle: Duration,
}

impl<S, B, E> DeltaStream<S>
where
    S: futures_util::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    pub fn new(body: S, idle: Duration) -> Self {
        let mut consumer = StreamConsumer::new();
        consumer.connect();
        Self {
            body,
            consumer,
            queue: VecDeque::new(),
            idle,
        }
    }

    /// Next delta, `None` once the stream completed, or an error once.
    pub async fn next_delta(&mut self) -> Option<Result<String, ClientError>> {
        loop {
            if let Some(delta) = self.queue.pop_front() {
                return Some(Ok(delta));
            }
            if self.consumer.state().is_terminal() {
                return None;
            }
            match tokio::time::timeout(self.idle, self.body.next()).await {
                Err(_) => {
                    self.consumer.fail("idle timeout");
                    return Some(Err(ClientError::IdleTimeout(self.idle)));
                }
                Ok(Some(Err(e))) => {
                    let reason = e.to_string();
                    self.consumer.fail(reason.clone());
                    return Some(Err(ClientError::Read(reason)));
                }
                Ok(Some(Ok(bytes))) => {
                    let deltas = self.consumer.feed(bytes.as_ref());
                    self.queue.extend(deltas);
                }
                Ok(None) => {
                    self.consumer.finish();
                    if let ConsumerState::Failed(_) = self.consumer.state() {
                        return Some(Err(ClientError::EmptyBody));
                    }
                }
            }
        }
    }

    pub fn state(&self) -> &ConsumerState {
        self.consumer.state()
    }

    /// Everything decoded so far; may run ahead of the deltas already
    /// handed out by [`next_delta`](Self::next_delta) within one read.
    pub fn transcript(&self) -> &str {
        self.consumer.transcript()
    }

    pub fn into_stream(self) -> impl futures_util::Stream<Item = Result<String, ClientError>> {
        futures_util::stream::unfold(self, |mut this| async move {
            this.next_delta().await.map(|item| (item, this))
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Body of a bridge response, as it comes off the socket.
pub type BodyStream = BoxStream<'static, Result<Vec<u8>, reqwest::Error>>;

const FALLBACK_ERROR: &str = "Failed to get response";

/// Talks to a running bridge.
pub struct ChatClient {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    idle: Duration,
}

impl ChatClient {
    pub fn new(url: impl Into<String>, token: Option<String>, timeouts: &Timeouts) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect())
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            token,
            idle: timeouts.client_idle(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST the message list and return the delta stream of the reply.
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
    ) -> Result<DeltaStream<BodyStream>, ClientError> {
        let body = ChatRequest {
            messages: messages.to_vec(),
        };
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .map(|b| b.error)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| FALLBACK_ERROR.to_string());
            debug!(status = status.as_u16(), message = %message, "bridge rejected request");
            return Err(ClientError::Http {
                status: status.as_u16(),
                message,
            });
        }
        if matches!(status.as_u16(), 204 | 205) {
            return Err(ClientError::EmptyBody);
        }

        let body = response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed();
        Ok(DeltaStream::new(body, self.idle))
    }

    /// Run one full exchange: append `text` as a user message, stream the
    /// reply into `sink`, and commit or roll back the assistant message.
    pub async fn send<K: ReplySink>(
        &self,
        conversation: &mut Conversation,
        text: &str,
        sink: &mut K,
    ) -> Result<ChatMessage, ClientError> {
        let payload = conversation.push_user(text);
        let stream = match self.stream_chat(&payload).await {
            Ok(stream) => stream,
            Err(e) => {
                sink.notify_error(&e.to_string());
                return Err(e);
            }
        };
        drive_reply(conversation, stream, sink).await
    }
}
