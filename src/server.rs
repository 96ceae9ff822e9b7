//! HTTP front door.
//!
//! One tokio task per connection. The chat route picks an endpoint, then
//! answers with a chunked `text/event-stream` body fed by [`relay`]. Anything
//! that fails before the first byte of that body is reported as a JSON
//! `{error}` response instead. JSON responses close the connection; a stream
//! that ended cleanly leaves it open for the next request. Every request read
//! is bounded by the idle timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::dispatcher::{select_endpoint, HttpProbe};
use crate::error::BridgeError;
use crate::providers::{ChatMessage, Endpoint, ErrorBody};
use crate::relay::{relay, ChunkedSink};

const CORS_HEADERS: &str = "Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Headers: authorization, x-client-info, apikey, content-type\r\n\
Access-Control-Allow-Methods: POST, OPTIONS\r\n";

const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Shared, read-only state for every connection.
pub struct AppState {
    pub endpoints: Arc<[Endpoint]>,
    pub probe: HttpProbe,
    pub api_key: Option<String>,
    pub max_body_bytes: usize,
    pub idle: Duration,
}

impl AppState {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            endpoints: config.endpoints.clone().into(),
            probe: HttpProbe::new(&config.timeouts),
            api_key: config.api_key.clone(),
            max_body_bytes: config.max_body_bytes,
            idle: config.timeouts.idle(),
        }
    }
}

/// Validate `config`, bind, and serve until the listener fails.
pub async fn serve(config: BridgeConfig) -> Result<(), BridgeError> {
    config.validate()?;
    let listener = TcpListener::bind(config.listen).await?;
    info!(
        listen = %config.listen,
        endpoints = config.endpoints.len(),
        auth = config.api_key.is_some(),
        "chat bridge listening"
    );
    serve_listener(listener, Arc::new(AppState::from_config(&config))).await
}

pub async fn serve_listener(listener: TcpListener, state: Arc<AppState>) -> Result<(), BridgeError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        let span = info_span!("connection", %peer);
        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(stream, peer, &state).await {
                    debug!(error = %e, "connection error");
                }
            }
            .instrument(span),
        );
    }
}

// -- Request parsing --------------------------------------------------------

#[derive(Debug)]
struct Request {
    method: String,
    path: String,
    authorization: Option<String>,
    body: Vec<u8>,
}

struct Head {
    len: usize,
    method: String,
    path: String,
    authorization: Option<String>,
    content_length: usize,
}

/// Read one request. `Ok(None)` when the peer closed before sending anything.
///
/// `pending` holds bytes already read past the previous request (pipelining);
/// on return it holds whatever arrived past this one.
async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    pending: &mut Vec<u8>,
    max_body: usize,
) -> Result<Option<Request>, BridgeError> {
    let mut buf = std::mem::take(pending);
    let mut chunk = [0u8; 4096];

    let head = loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(&buf) {
                Ok(httparse::Status::Complete(len)) => break parse_head(&req, len)?,
                Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_BYTES => {
                    return Err(BridgeError::InvalidBody("request head too large".into()));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(BridgeError::InvalidBody(e.to_string())),
            }
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(BridgeError::InvalidBody("incomplete request head".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    if head.content_length > max_body {
        return Err(BridgeError::PayloadTooLarge { limit: max_body });
    }

    let mut body = buf.split_off(head.len);
    while body.len() < head.content_length {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(BridgeError::InvalidBody("truncated request body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    *pending = body.split_off(head.content_length);

    Ok(Some(Request {
        method: head.method,
        path: head.path,
        authorization: head.authorization,
        body,
    }))
}

fn parse_head(req: &httparse::Request<'_, '_>, len: usize) -> Result<Head, BridgeError> {
    let mut content_length = 0;
    let mut authorization = None;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| BridgeError::InvalidBody("invalid Content-Length".into()))?;
        } else if header.name.eq_ignore_ascii_case("authorization") {
            authorization = Some(String::from_utf8_lossy(header.value).into_owned());
        }
    }
    let path = req.path.unwrap_or("/");
    Ok(Head {
        len,
        method: req.method.unwrap_or("").to_string(),
        path: path.split('?').next().unwrap_or(path).to_string(),
        authorization,
        content_length,
    })
}

/// Extract the message list from a chat request body.
pub fn parse_messages(body: &[u8]) -> Result<Vec<ChatMessage>, BridgeError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| BridgeError::InvalidBody(e.to_string()))?;
    let items = match value {
        Value::Object(mut map) => match map.remove("messages") {
            Some(Value::Array(items)) if !items.is_empty() => items,
            _ => return Err(BridgeError::MissingMessages),
        },
        _ => return Err(BridgeError::MissingMessages),
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item)
                .map_err(|e| BridgeError::InvalidBody(format!("message {i}: {e}")))
        })
        .collect()
}

/// With no configured key every request is allowed.
fn authorized(expected: Option<&str>, header: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token.trim().as_bytes().ct_eq(expected.as_bytes()).into(),
        None => false,
    }
}

// -- Responses --------------------------------------------------------------

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

fn json_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{CORS_HEADERS}Connection: close\r\n\r\n{body}",
        reason(status),
        body.len(),
    )
}

fn error_response(status: u16, message: &str) -> String {
    let body = serde_json::to_string(&ErrorBody {
        error: message.to_string(),
    })
    .unwrap_or_else(|_| "{\"error\":\"internal error\"}".to_string());
    json_response(status, &body)
}

fn sse_head() -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\nTransfer-Encoding: chunked\r\n{CORS_HEADERS}\r\n"
    )
}

// -- Connection handling ----------------------------------------------------

/// What the connection may do after a response.
enum After {
    KeepAlive,
    Close,
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: &AppState,
) -> Result<(), BridgeError> {
    let mut pending = Vec::new();
    loop {
        let next = read_request(&mut stream, &mut pending, state.max_body_bytes);
        let Ok(read) = tokio::time::timeout(state.idle, next).await else {
            debug!(%peer, "idle connection closed");
            return Ok(());
        };
        let request = match read {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, %peer, "bad request");
                stream.write_all(error_response(e.status(), &e.to_string()).as_bytes()).await?;
                return Ok(());
            }
        };
        let span = info_span!(
            "request",
            request_id = %Uuid::new_v4(),
            method = %request.method,
            path = %request.path
        );
        match handle_request(&mut stream, state, &request).instrument(span).await? {
            After::KeepAlive => continue,
            After::Close => return Ok(()),
        }
    }
}

async fn handle_request(
    stream: &mut TcpStream,
    state: &AppState,
    request: &Request,
) -> Result<After, BridgeError> {
    let response = match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => {
            format!("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n{CORS_HEADERS}Connection: close\r\n\r\n")
        }
        ("GET", "/health") => {
            let body = serde_json::json!({ "status": "ok", "endpoints": state.endpoints.len() });
            json_response(200, &body.to_string())
        }
        ("POST", "/" | "/chat") => return handle_chat(stream, state, request).await,
        (_, "/" | "/chat" | "/health") => error_response(405, "method not allowed"),
        _ => error_response(404, "not found"),
    };
    stream.write_all(response.as_bytes()).await?;
    Ok(After::Close)
}

async fn handle_chat(
    stream: &mut TcpStream,
    state: &AppState,
    request: &Request,
) -> Result<After, BridgeError> {
    if !authorized(state.api_key.as_deref(), request.authorization.as_deref()) {
        let e = BridgeError::Unauthorized;
        warn!("rejected request without valid bearer token");
        stream.write_all(error_response(e.status(), &e.to_string()).as_bytes()).await?;
        return Ok(After::Close);
    }

    let selection = match parse_messages(&request.body) {
        Ok(messages) => select_endpoint(&state.endpoints, &state.probe, &messages).await,
        Err(e) => Err(e),
    };
    let selection = match selection {
        Ok(selection) => selection,
        Err(e) => {
            warn!(error = %e, "request failed before streaming");
            stream.write_all(error_response(e.status(), &e.to_string()).as_bytes()).await?;
            return Ok(After::Close);
        }
    };

    stream
        .write_all(sse_head().as_bytes())
        .await
        .map_err(BridgeError::ClientGone)?;

    let mut sink = ChunkedSink::new(&mut *stream);
    match relay(selection.stream, &mut sink, state.idle).await {
        Ok(stats) => {
            info!(
                endpoint = %selection.endpoint,
                attempts = selection.attempts.len(),
                frames = stats.frames,
                dropped_lines = stats.dropped_lines,
                "stream completed"
            );
            Ok(After::KeepAlive)
        }
        Err(e) => {
            warn!(endpoint = %selection.endpoint, error = %e, "stream aborted");
            // No terminating chunk: the client sees a truncated body.
            let _ = stream.shutdown().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use rstest::rstest;

    async fn read(raw: &[u8], max: usize) -> Result<Option<Request>, BridgeError> {
        let mut reader = raw;
        read_request(&mut reader, &mut Vec::new(), max).await
    }

    #[tokio::test]
    async fn reads_head_and_body() {
        let raw = b"POST /chat?x=1 HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\nAuthorization: Bearer t\r\n\r\nbodyEXTRA";
        let req = read(raw, 1024).await.expect("read").expect("request");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/chat");
        assert_eq!(req.body, b"body");
        assert_eq!(req.authorization.as_deref(), Some("Bearer t"));
    }

    #[tokio::test]
    async fn body_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"POST / HTTP/1.1\r\nContent-Length: 6\r\n")
            .read(b"\r\nab")
            .read(b"cdef")
            .build();
        let mut reader = mock;
        let req = read_request(&mut reader, &mut Vec::new(), 1024)
            .await
            .expect("read")
            .expect("request");
        assert_eq!(req.body, b"abcdef");
    }

    #[tokio::test]
    async fn pipelined_requests_are_read_in_turn() {
        let raw = b"POST /chat HTTP/1.1\r\nContent-Length: 2\r\n\r\nabGET /health HTTP/1.1\r\n\r\n";
        let mut reader = raw.as_slice();
        let mut pending = Vec::new();

        let first = read_request(&mut reader, &mut pending, 1024)
            .await
            .expect("read")
            .expect("first");
        assert_eq!(first.body, b"ab");
        assert_eq!(pending, b"GET /health HTTP/1.1\r\n\r\n");

        let second = read_request(&mut reader, &mut pending, 1024)
            .await
            .expect("read")
            .expect("second");
        assert_eq!((second.method.as_str(), second.path.as_str()), ("GET", "/health"));
        assert!(second.body.is_empty());
        assert!(pending.is_empty());

        assert!(read_request(&mut reader, &mut pending, 1024)
            .await
            .expect("read")
            .is_none());
    }

    #[tokio::test]
    async fn empty_connection_is_none() {
        assert!(read(b"", 1024).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_reading_it() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5000\r\n\r\n";
        let err = read(raw, 100).await.unwrap_err();
        assert!(matches!(err, BridgeError::PayloadTooLarge { limit: 100 }));
        assert_eq!(err.status(), 413);
    }

    #[tokio::test]
    async fn truncated_body_is_invalid() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(read(raw, 1024).await, Err(BridgeError::InvalidBody(_))));
    }

    #[tokio::test]
    async fn garbage_head_is_invalid() {
        assert!(matches!(
            read(b"\x01\x02 nonsense\r\n\r\n", 1024).await,
            Err(BridgeError::InvalidBody(_))
        ));
    }

    #[test]
    fn parses_messages_in_order() {
        let body = br#"{"messages":[{"role":"user","content":"a"},{"role":"assistant","content":"b"}]}"#;
        let messages = parse_messages(body).expect("parse");
        assert_eq!(messages, vec![ChatMessage::user("a"), ChatMessage::assistant("b")]);
    }

    #[rstest]
    #[case(br#"{}"#.as_slice())]
    #[case(br#"{"messages":null}"#.as_slice())]
    #[case(br#"{"messages":"hi"}"#.as_slice())]
    #[case(br#"{"messages":[]}"#.as_slice())]
    #[case(br#"[1,2]"#.as_slice())]
    fn missing_messages(#[case] body: &[u8]) {
        let err = parse_messages(body).unwrap_err();
        assert!(matches!(err, BridgeError::MissingMessages));
        assert_eq!(err.to_string(), "Messages array is required");
    }

    #[rstest]
    #[case(b"not json".as_slice())]
    #[case(br#"{"messages":[{"role":"system","content":"x"}]}"#.as_slice())]
    #[case(br#"{"messages":[{"role":"user"}]}"#.as_slice())]
    fn invalid_bodies(#[case] body: &[u8]) {
        assert!(matches!(parse_messages(body), Err(BridgeError::InvalidBody(_))));
    }

    #[rstest]
    #[case(None, None, true)]
    #[case(None, Some("Bearer anything"), true)]
    #[case(Some("k"), Some("Bearer k"), true)]
    #[case(Some("k"), Some("Bearer kk"), false)]
    #[case(Some("k"), Some("k"), false)]
    #[case(Some("k"), None, false)]
    fn bearer_check(#[case] key: Option<&str>, #[case] header: Option<&str>, #[case] ok: bool) {
        assert_eq!(authorized(key, header), ok);
    }

    #[test]
    fn error_response_carries_cors_and_json() {
        let resp = error_response(500, "Messages array is required");
        assert!(resp.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(resp.contains("Access-Control-Allow-Origin: *"));
        assert!(resp.ends_with(r#"{"error":"Messages array is required"}"#));
    }

    #[test]
    fn sse_head_is_chunked_event_stream() {
        let head = sse_head();
        assert!(head.contains("Content-Type: text/event-stream\r\n"));
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    fn unreachable_state() -> Arc<AppState> {
        let config = BridgeConfig {
            endpoints: vec![Endpoint::new("http://127.0.0.1:9", "m")],
            api_key: Some("secret".into()),
            max_body_bytes: 256,
            timeouts: Timeouts { connect_secs: 1, accept_secs: 1, ..Timeouts::default() },
            ..BridgeConfig::default()
        };
        Arc::new(AppState::from_config(&config))
    }

    async fn roundtrip(state: Arc<AppState>, raw: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(serve_listener(listener, state));
        let mut conn = TcpStream::connect(addr).await.expect("connect");
        conn.write_all(raw.as_bytes()).await.expect("write");
        let mut out = String::new();
        conn.read_to_string(&mut out).await.expect("read");
        out
    }

    #[tokio::test]
    async fn routes() {
        let state = unreachable_state();
        let health = roundtrip(state.clone(), "GET /health HTTP/1.1\r\n\r\n").await;
        assert!(health.starts_with("HTTP/1.1 200 OK"));
        assert!(health.contains(r#""status":"ok""#));
        assert!(health.contains(r#""endpoints":1"#));

        let options = roundtrip(state.clone(), "OPTIONS /chat HTTP/1.1\r\n\r\n").await;
        assert!(options.starts_with("HTTP/1.1 200 OK"));
        assert!(options.contains("Access-Control-Allow-Headers: authorization, x-client-info, apikey, content-type"));

        let missing = roundtrip(state.clone(), "GET /nope HTTP/1.1\r\n\r\n").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        let wrong = roundtrip(state, "GET /chat HTTP/1.1\r\n\r\n").await;
        assert!(wrong.starts_with("HTTP/1.1 405"));
    }

    #[tokio::test]
    async fn chat_requires_bearer_when_configured() {
        let body = r#"{"messages":[{"role":"user","content":"hi"}]}"#;
        let raw = format!("POST /chat HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}", body.len());
        let resp = roundtrip(unreachable_state(), &raw).await;
        assert!(resp.starts_with("HTTP/1.1 401"), "got: {resp}");
    }

    #[tokio::test]
    async fn chat_validation_fails_before_any_endpoint() {
        let body = r#"{"messages":[]}"#;
        let raw = format!(
            "POST / HTTP/1.1\r\nAuthorization: Bearer secret\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let resp = roundtrip(unreachable_state(), &raw).await;
        assert!(resp.starts_with("HTTP/1.1 500"));
        assert!(resp.ends_with(r#"{"error":"Messages array is required"}"#));
    }

    #[tokio::test]
    async fn chat_with_only_dead_endpoints_is_500() {
        let body = r#"{"messages":[{"role":"user","content":"hi"}]}"#;
        let raw = format!(
            "POST /chat HTTP/1.1\r\nAuthorization: Bearer secret\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let resp = roundtrip(unreachable_state(), &raw).await;
        assert!(resp.starts_with("HTTP/1.1 500"), "got: {resp}");
        assert!(resp.contains("endpoints failed"));
    }

    #[tokio::test]
    async fn silent_connection_is_closed_after_idle() {
        let config = BridgeConfig {
            endpoints: vec![Endpoint::new("http://127.0.0.1:9", "m")],
            timeouts: Timeouts { idle_secs: 1, ..Timeouts::default() },
            ..BridgeConfig::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(serve_listener(listener, Arc::new(AppState::from_config(&config))));

        let mut conn = TcpStream::connect(addr).await.expect("connect");
        conn.write_all(b"POST /chat HTTP/1.1\r\n").await.expect("write");
        let mut out = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut out))
            .await
            .expect("server must close a stalled connection")
            .expect("read");
        assert_eq!(n, 0, "nothing is written to a peer that never finished its head");
    }

    #[tokio::test]
    async fn oversized_request_is_413() {
        let raw = "POST /chat HTTP/1.1\r\nContent-Length: 100000\r\n\r\n";
        let resp = roundtrip(unreachable_state(), raw).await;
        assert!(resp.starts_with("HTTP/1.1 413"));
    }
}
