use serde::{Deserialize, Serialize};

// -- Conversation types ----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry of a conversation. Order within a conversation is significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Body accepted by the bridge and sent by [`crate::consumer::ChatClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
}

/// JSON body of every non-streaming error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// -- Backend endpoints -----------------------------------------------------

/// A candidate inference backend. Position in the configured list is its
/// failover priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Base URL, e.g. `http://127.0.0.1:11434`.
    pub address: String,
    pub model: String,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, model: impl Into<String>) -> Self {
        Self { address: address.into(), model: model.into() }
    }

    /// URL of the streaming chat route on this backend.
    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.address.trim_end_matches('/'))
    }

    /// Parse the `URL=MODEL` form used on the command line.
    pub fn parse_spec(spec: &str) -> Result<Self, String> {
        let (address, model) = spec
            .rsplit_once('=')
            .ok_or_else(|| format!("expected URL=MODEL, got '{spec}'"))?;
        let address = address.trim();
        let model = model.trim();
        if address.is_empty() || model.is_empty() {
            return Err(format!("expected URL=MODEL, got '{spec}'"));
        }
        Ok(Self::new(address, model))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.address, self.model)
    }
}

// -- Ollama-style NDJSON types ---------------------------------------------

#[derive(Debug, Serialize)]
pub struct BackendChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct BackendMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// One line of a backend stream. Only `message.content` matters; `done`,
/// timings and the rest are ignored.
#[derive(Debug, Deserialize)]
pub struct BackendChunk {
    #[serde(default)]
    pub message: Option<BackendMessage>,
    #[serde(default)]
    pub error: Option<String>,
}

// -- OpenAI-style SSE delta types ------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeltaChoice {
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub index: u32,
}

/// Client-side view of one outbound SSE payload. Every field is optional so
/// that foreign OpenAI-style chunks parse too.
#[derive(Debug, Deserialize)]
pub struct DeltaChunk {
    #[serde(default)]
    pub choices: Vec<DeltaChoice>,
}

impl DeltaChunk {
    /// `choices[0].delta.content`, if present and non-empty.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .filter(|s| !s.is_empty())
    }
}
