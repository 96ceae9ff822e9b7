//! Error taxonomy for both halves of the bridge.
//!
//! [`BridgeError`] covers the server side (request validation, failover,
//! relay). [`ClientError`] covers the consuming side. Frame-level decode
//! failures never appear here: a bad line is dropped where it is read.

use std::time::Duration;

use thiserror::Error;

/// Server-side failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// `messages` missing, not an array, or empty.
    #[error("Messages array is required")]
    MissingMessages,

    /// Request body was not valid JSON or carried an invalid message.
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    /// The endpoint list is empty.
    #[error("no endpoints configured")]
    NoEndpoints,

    /// Every candidate rejected the request.
    #[error("all {attempts} endpoints failed; last error: {last}")]
    Exhausted { attempts: usize, last: String },

    /// An endpoint answered with a success status but no body to stream.
    #[error("No response body from {address}")]
    EmptyBody { address: String },

    /// The committed backend stream broke mid-flight.
    #[error("backend stream error: {0}")]
    Backend(String),

    /// The committed backend stream went quiet for longer than the idle limit.
    #[error("backend stream idle for {0:?}")]
    IdleTimeout(Duration),

    /// Writing to the downstream client failed.
    #[error("client disconnected: {0}")]
    ClientGone(#[source] std::io::Error),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// HTTP status used when this error is reported before streaming starts.
    ///
    /// Validation and failover failures deliberately map to 500: callers of
    /// the bridge only distinguish "streaming" from "not streaming".
    pub fn status(&self) -> u16 {
        match self {
            BridgeError::Unauthorized => 401,
            BridgeError::PayloadTooLarge { .. } => 413,
            _ => 500,
        }
    }
}

/// Client-side failures while talking to the bridge.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The bridge answered with a non-success status.
    #[error("{message}")]
    Http { status: u16, message: String },

    /// The request could not be sent at all.
    #[error("request failed: {0}")]
    Transport(String),

    /// Success status but nothing to read.
    #[error("No response body")]
    EmptyBody,

    /// The body stream failed after streaming began.
    #[error("stream read failed: {0}")]
    Read(String),

    #[error("no data from bridge for {0:?}")]
    IdleTimeout(Duration),

    /// The stream ended without producing any content.
    #[error("No response received")]
    NoResponse,
}
