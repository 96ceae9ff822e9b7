//! Ordered endpoint failover.
//!
//! [`select_endpoint`] walks the candidate list top to bottom and stops at the
//! first endpoint that accepts the request. The network side is injected via
//! [`EndpointProbe`] so the walk can be tested without sockets; [`HttpProbe`]
//! is the production implementation.
//!
//! ```text
//! A (reject) -> B (accept) -> stream from B      C is never contacted
//! A (reject) -> B (reject) -> Exhausted { last: B's reason }
//! A (success, no body)     -> EmptyBody          no failover
//! ```

use std::future::Future;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::config::Timeouts;
use crate::error::BridgeError;
use crate::providers::{BackendChatRequest, ChatMessage, Endpoint};

/// Raw body chunks of an accepted backend response.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, BridgeError>>;

/// Result of offering the request to one candidate.
pub enum Attempt<S> {
    /// Success status and a readable body; this stream becomes the request's.
    Accepted(S),
    /// Move on to the next candidate.
    Rejected(String),
}

/// Opens a streaming chat request against one endpoint.
///
/// Returning `Err` aborts the whole walk: it is reserved for failures that
/// happen after an endpoint has already been committed to.
pub trait EndpointProbe {
    type Stream;

    fn probe<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        messages: &'a [ChatMessage],
    ) -> impl Future<Output = Result<Attempt<Self::Stream>, BridgeError>> + Send + 'a;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Accepted,
    Rejected(String),
}

/// One line of the attempt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub endpoint: Endpoint,
    pub outcome: AttemptOutcome,
}

/// The endpoint that accepted, its stream, and every attempt made to get there.
pub struct Selection<S> {
    pub index: usize,
    pub endpoint: Endpoint,
    pub stream: S,
    pub attempts: Vec<AttemptRecord>,
}

/// Offer `messages` to each candidate in order until one accepts.
///
/// Fails with [`BridgeError::MissingMessages`] or [`BridgeError::NoEndpoints`]
/// before probing anything, and with [`BridgeError::Exhausted`] (naming the
/// last rejection) when every candidate rejects.
pub async fn select_endpoint<P: EndpointProbe>(
    candidates: &[Endpoint],
    probe: &P,
    messages: &[ChatMessage],
) -> Result<Selection<P::Stream>, BridgeError> {
    if messages.is_empty() {
        return Err(BridgeError::MissingMessages);
    }
    if candidates.is_empty() {
        return Err(BridgeError::NoEndpoints);
    }

    let mut attempts = Vec::with_capacity(candidates.len());
    for (index, endpoint) in candidates.iter().enumerate() {
        debug!(address = %endpoint.address, model = %endpoint.model, "trying endpoint");
        match probe.probe(endpoint, messages).await? {
            Attempt::Accepted(stream) => {
                info!(
                    address = %endpoint.address,
                    model = %endpoint.model,
                    attempt = index + 1,
                    "endpoint accepted request"
                );
                attempts.push(AttemptRecord {
                    endpoint: endpoint.clone(),
                    outcome: AttemptOutcome::Accepted,
                });
                return Ok(Selection {
                    index,
                    endpoint: endpoint.clone(),
                    stream,
                    attempts,
                });
            }
            Attempt::Rejected(reason) => {
                warn!(address = %endpoint.address, reason = %reason, "endpoint rejected request");
                attempts.push(AttemptRecord {
                    endpoint: endpoint.clone(),
                    outcome: AttemptOutcome::Rejected(reason),
                });
            }
        }
    }

    let last = attempts
        .iter()
        .rev()
        .find_map(|a| match &a.outcome {
            AttemptOutcome::Rejected(reason) => Some(reason.clone()),
            AttemptOutcome::Accepted => None,
        })
        .unwrap_or_else(|| "All endpoints failed".to_string());
    Err(BridgeError::Exhausted {
        attempts: attempts.len(),
        last,
    })
}

// ---------------------------------------------------------------------------
// HTTP probe
// ---------------------------------------------------------------------------

/// Probes Ollama-compatible backends over HTTP (`POST {address}/api/chat`).
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    accept_timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeouts: &Timeouts) -> Self {
        // No overall request timeout: it would also cut off long streams.
        // Acceptance is bounded per attempt, the stream by the relay's idle limit.
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect())
            .build()
            .unwrap_or_default();
        Self {
            client,
            accept_timeout: timeouts.accept(),
        }
    }
}

impl EndpointProbe for HttpProbe {
    type Stream = ByteStream;

    fn probe<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        messages: &'a [ChatMessage],
    ) -> impl Future<Output = Result<Attempt<ByteStream>, BridgeError>> + Send + 'a {
        async move {
            let url = endpoint.chat_url();
            let body = BackendChatRequest {
                model: &endpoint.model,
                messages,
                stream: true,
            };
            let send = self.client.post(&url).json(&body).send();

            let response = match tokio::time::timeout(self.accept_timeout, send).await {
                Err(_) => {
                    return Ok(Attempt::Rejected(format!(
                        "{url} did not respond within {:?}",
                        self.accept_timeout
                    )))
                }
                Ok(Err(e)) => return Ok(Attempt::Rejected(format!("{url}: {e}"))),
                Ok(Ok(r)) => r,
            };

            let status = response.status();
            if !status.is_success() {
                return Ok(Attempt::Rejected(format!("{url} returned status {status}")));
            }
            if matches!(status.as_u16(), 204 | 205) || response.content_length() == Some(0) {
                return Err(BridgeError::EmptyBody {
                    address: endpoint.address.clone(),
                });
            }

            let stream = response
                .bytes_stream()
                .map(|chunk| {
                    chunk
                        .map(|b| b.to_vec())
                        .map_err(|e| BridgeError::Backend(e.to_string()))
                })
                .boxed();
            Ok(Attempt::Accepted(stream))
        }
    }
}
