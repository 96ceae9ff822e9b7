//! Conversation history with a speculative assistant reply.
//!
//! A reply is shown as soon as the bridge accepts the request, grows while
//! deltas arrive, and is either committed to history or rolled back. History
//! only ever contains committed messages.

use std::fmt::Display;

use tracing::debug;

use crate::consumer::DeltaStream;
use crate::error::ClientError;
use crate::providers::ChatMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyState {
    /// Placeholder shown, nothing received yet.
    Pending,
    /// Full transcript received so far.
    Streaming(String),
    Committed,
    RolledBack,
}

impl ReplyState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ReplyState::Pending | ReplyState::Streaming(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    reply: Option<ReplyState>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed history, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn reply(&self) -> Option<&ReplyState> {
        self.reply.as_ref()
    }

    /// Append a user message and return the full history to send. The user
    /// message stays in history even if the reply later fails.
    pub fn push_user(&mut self, content: impl Into<String>) -> Vec<ChatMessage> {
        self.messages.push(ChatMessage::user(content));
        self.reply = None;
        self.messages.clone()
    }

    pub fn begin_reply(&mut self) {
        self.reply = Some(ReplyState::Pending);
    }

    /// Replace the speculative reply with the transcript so far. Ignored when
    /// no reply is in flight.
    pub fn apply_transcript(&mut self, transcript: &str) {
        if self.reply.as_ref().is_some_and(ReplyState::is_in_flight) {
            self.reply = Some(ReplyState::Streaming(transcript.to_string()));
        }
    }

    /// Append the speculative reply to history. An empty reply is rolled back
    /// and reported as [`ClientError::NoResponse`].
    pub fn commit(&mut self) -> Result<ChatMessage, ClientError> {
        match self.reply.take() {
            Some(ReplyState::Streaming(text)) if !text.is_empty() => {
                let message = ChatMessage::assistant(text);
                self.messages.push(message.clone());
                self.reply = Some(ReplyState::Committed);
                Ok(message)
            }
            Some(ReplyState::Pending) | Some(ReplyState::Streaming(_)) => {
                self.reply = Some(ReplyState::RolledBack);
                Err(ClientError::NoResponse)
            }
            other => {
                self.reply = other;
                Err(ClientError::NoResponse)
            }
        }
    }

    /// Discard the speculative reply. No-op when nothing is in flight.
    pub fn roll_back(&mut self) {
        if self.reply.as_ref().is_some_and(ReplyState::is_in_flight) {
            self.reply = Some(ReplyState::RolledBack);
        }
    }

    /// History plus the in-flight reply, as it should be displayed.
    pub fn visible(&self) -> Vec<ChatMessage> {
        let mut out = self.messages.clone();
        match &self.reply {
            Some(ReplyState::Pending) => out.push(ChatMessage::assistant("")),
            Some(ReplyState::Streaming(text)) => out.push(ChatMessage::assistant(text.clone())),
            _ => {}
        }
        out
    }
}

/// Presentation callbacks for one exchange.
pub trait ReplySink {
    /// The bridge accepted the request; show an empty assistant entry.
    fn show_pending(&mut self) {}

    /// Replace the assistant entry with the full transcript so far.
    fn replace_reply(&mut self, transcript: &str);

    fn commit(&mut self, _message: &ChatMessage) {}

    /// Remove the assistant entry.
    fn roll_back(&mut self) {}

    /// Called at most once per exchange.
    fn notify_error(&mut self, message: &str);
}

/// Stream one reply into `conversation` and `sink`.
///
/// On a mid-stream failure, a non-empty partial reply is kept; an empty one
/// is rolled back. Either way the sink gets exactly one error notification.
pub async fn drive_reply<S, B, E, K>(
    conversation: &mut Conversation,
    mut stream: DeltaStream<S>,
    sink: &mut K,
) -> Result<ChatMessage, ClientError>
where
    S: futures_util::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
    K: ReplySink,
{
    conversation.begin_reply();
    sink.show_pending();

    let mut transcript = String::new();
    while let Some(item) = stream.next_delta().await {
        match item {
            Ok(delta) => {
                transcript.push_str(&delta);
                conversation.apply_transcript(&transcript);
                sink.replace_reply(&transcript);
            }
            Err(e) => {
                debug!(error = %e, received = transcript.len(), "reply interrupted");
                match conversation.commit() {
                    Ok(partial) => sink.commit(&partial),
                    Err(_) => sink.roll_back(),
                }
                sink.notify_error(&e.to_string());
                return Err(e);
            }
        }
    }

    match conversation.commit() {
        Ok(message) => {
            sink.commit(&message);
            Ok(message)
        }
        Err(e) => {
            sink.roll_back();
            sink.notify_error(&e.to_string());
            Err(e)
        }
    }
}
