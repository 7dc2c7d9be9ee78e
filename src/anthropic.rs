//! # Anthropic Messages backend
//!
//! [`GenerationBackend`] over the Anthropic Messages API with `stream: true`.
//! The response body is a server-sent event stream; this module only frames it
//! into `data:` payloads. Interpreting the payloads (`content_block_delta`,
//! in-band `error` events) is left to [`crate::generator`].
//!
//! Status mapping:
//!
//! | response                 | result                          |
//! |--------------------------|---------------------------------|
//! | 2xx                      | payload stream                  |
//! | 429                      | [`BackendError::Throttled`]     |
//! | any other status         | [`BackendError::Api`]           |
//! | no headers before timeout| [`BackendError::Timeout`]       |
//! | body silent past timeout | [`BackendError::Timeout`]       |
//! | connection failure       | [`BackendError::Transport`]     |

use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::generator::{BackendError, EventStream, GenerationBackend, GenerationRequest, Role};

pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Create a new HTTP client for the Messages API.
///
/// Only the connect phase is bounded here. The wait for response headers and
/// every gap between body chunks are bounded per request by the backend.
pub fn create_client() -> Result<Client, BackendError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| BackendError::Transport(format!("could not build HTTP client: {e}")))
}

pub struct AnthropicBackend {
    client: Client,
    base_url: String,
    api_key: String,
    version: String,
    response_timeout: Duration,
}

impl AnthropicBackend {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            version: DEFAULT_ANTHROPIC_VERSION.to_string(),
            response_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Upper bound on the wait for response headers and on each silent gap in
    /// the event stream.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

/// JSON body for a streaming Messages call. System messages are lifted into
/// the top-level `system` field.
pub fn request_body(request: &GenerationRequest) -> Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| json!({ "role": m.role.to_string(), "content": m.content }))
        .collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "top_p": request.top_p,
        "stream": true,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system.join("\n\n"));
    }
    body
}

/// Pull a readable message out of an error response body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[async_trait]
impl GenerationBackend for AnthropicBackend {
    async fn open_stream(&self, request: &GenerationRequest) -> Result<EventStream, BackendError> {
        let url = self.endpoint();
        info!("Anthropic request to {} model={}", url, request.model);

        let send = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .header("content-type", "application/json")
            .json(&request_body(request))
            .send();

        let response = match tokio::time::timeout(self.response_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!("HTTP request failed: {}", e);
                return Err(BackendError::Transport(e.to_string()));
            }
            Err(_) => return Err(BackendError::Timeout(self.response_timeout)),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            warn!("Anthropic rate limited the request");
            return Err(BackendError::Throttled(error_message(&body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Anthropic error {}: {:.500}", status, body);
            return Err(BackendError::Api {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        debug!("Anthropic stream accepted ({})", status);
        Ok(sse_payloads(response.bytes_stream(), self.response_timeout))
    }
}

struct SseReader<B, E> {
    body: BoxStream<'static, Result<B, E>>,
    idle_timeout: Duration,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    finished: bool,
}

impl<B: AsRef<[u8]>, E> SseReader<B, E> {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        // Lines are decoded only once complete, so multi-byte characters split
        // across chunks survive.
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.accept(&line);
        }
    }

    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.accept(&line);
        }
    }

    fn accept(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\n', '\r']);
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            if !data.is_empty() && data != "[DONE]" {
                self.pending.push_back(data.to_string());
            }
        }
    }
}

/// Frame a server-sent event body into its `data:` payloads.
///
/// Comment, `event:` and blank lines are dropped. A read error ends the
/// stream with [`BackendError::Transport`]; a body that stays silent for
/// `idle_timeout` ends it with [`BackendError::Timeout`].
pub fn sse_payloads<S, B, E>(body: S, idle_timeout: Duration) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let reader = SseReader {
        body: body.boxed(),
        idle_timeout,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(payload) = reader.pending.pop_front() {
                return Some((Ok(payload), reader));
            }
            if reader.finished {
                return None;
            }
            let read = tokio::time::timeout(reader.idle_timeout, reader.body.next()).await;
            let Ok(next) = read else {
                warn!("No stream data for {:?}, closing", reader.idle_timeout);
                reader.finished = true;
                reader.pending.clear();
                return Some((Err(BackendError::Timeout(reader.idle_timeout)), reader));
            };
            match next {
                Some(Ok(chunk)) => reader.push(chunk.as_ref()),
                Some(Err(e)) => {
                    reader.finished = true;
                    reader.pending.clear();
                    let err = BackendError::Transport(format!("stream read error: {e}"));
                    return Some((Err(err), reader));
                }
                None => {
                    reader.finished = true;
                    reader.flush();
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{
        ChatMessage, GenerationError, GenerationParams, RetryPolicy, StreamingGenerator,
    };
    use httpmock::prelude::*;
    use std::sync::Arc;

    const SSE_BODY: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Jazz \"}}\n\
\n\
event: ping\n\
data: {\"type\":\"ping\"}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"tonight.\"}}\n\
\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

    const IDLE: Duration = Duration::from_secs(5);

    fn request() -> GenerationRequest {
        GenerationParams::default().request("What's on?".into())
    }

    fn backend(server: &MockServer) -> AnthropicBackend {
        AnthropicBackend::new(create_client().unwrap(), server.base_url(), "test-key")
    }

    #[tokio::test]
    async fn test_streams_payloads_from_messages_endpoint() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .header("x-api-key", "test-key")
                    .header("anthropic-version", "2023-06-01");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(SSE_BODY);
            })
            .await;

        let payloads: Vec<String> = backend(&server)
            .open_stream(&request())
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        mock.assert_async().await;
        assert_eq!(payloads.len(), 5);
        assert!(payloads[1].contains("\"Jazz \""));
    }

    #[tokio::test]
    async fn test_generator_over_http_yields_text() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(200).body(SSE_BODY);
            })
            .await;

        let generator = StreamingGenerator::new(
            Arc::new(backend(&server)),
            RetryPolicy::default(),
            GenerationParams::default(),
        );
        let text = generator.generate("hi").await.unwrap().collect_text().await.unwrap();
        assert_eq!(text, "Jazz tonight.");
    }

    #[tokio::test]
    async fn test_429_is_throttling() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(429).json_body(serde_json::json!({
                    "type": "error",
                    "error": { "type": "rate_limit_error", "message": "Too many requests" }
                }));
            })
            .await;

        let err = backend(&server).open_stream(&request()).await.err().unwrap();
        assert_eq!(err, BackendError::Throttled("Too many requests".into()));
        assert!(err.is_throttling());
    }

    #[tokio::test]
    async fn test_other_statuses_are_api_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(529).body("overloaded");
            })
            .await;

        let err = backend(&server).open_stream(&request()).await.err().unwrap();
        assert_eq!(
            err,
            BackendError::Api {
                status: 529,
                message: "overloaded".into()
            }
        );
        assert!(!err.is_throttling());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let backend = AnthropicBackend::new(create_client().unwrap(), "http://127.0.0.1:1", "k");
        let err = backend.open_stream(&request()).await.err().unwrap();
        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[test]
    fn test_request_body_shape() {
        let mut request = request();
        request.messages.insert(
            0,
            ChatMessage {
                role: Role::System,
                content: "Be brief.".into(),
            },
        );
        let body = request_body(&request);

        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(
            body["messages"],
            serde_json::json!([{ "role": "user", "content": "What's on?" }])
        );
    }

    #[tokio::test]
    async fn test_sse_framing_handles_split_chunks() {
        // "Köln" split inside the two-byte 'ö', CRLF line endings and a trailing line without newline.
        let raw = "data: {\"t\":\"Köln\"}\r\n\r\n: keep-alive\r\ndata:{\"t\":2}\r\ndata: [DONE]\r\ndata: last";
        let bytes = raw.as_bytes();
        let split = raw.find('ö').unwrap() + 1;
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(bytes[..split].to_vec()),
            Ok(bytes[split..20].to_vec()),
            Ok(bytes[20..].to_vec()),
        ];

        let payloads: Vec<_> = sse_payloads(stream::iter(chunks), IDLE).collect().await;
        assert_eq!(
            payloads,
            vec![
                Ok("{\"t\":\"Köln\"}".to_string()),
                Ok("{\"t\":2}".to_string()),
                Ok("last".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_sse_read_error_ends_stream() {
        let chunks: Vec<Result<&'static [u8], String>> =
            vec![Ok(b"data: one\n".as_slice()), Err("connection reset".to_string())];
        let payloads: Vec<_> = sse_payloads(stream::iter(chunks), IDLE).collect().await;

        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], Ok("one".to_string()));
        assert!(matches!(payloads[1], Err(BackendError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_body_times_out_after_first_payload() {
        let chunks: Vec<Result<&'static [u8], String>> = vec![Ok(b"data: one\n".as_slice())];
        let body = stream::iter(chunks).chain(stream::pending());
        let mut payloads = sse_payloads(body, Duration::from_millis(500));

        assert_eq!(payloads.next().await, Some(Ok("one".to_string())));
        assert_eq!(
            payloads.next().await,
            Some(Err(BackendError::Timeout(Duration::from_millis(500))))
        );
        assert_eq!(payloads.next().await, None);
    }

    /// Serve one request: send headers and a single delta, then hold the
    /// connection open without writing.
    fn stalling_server(hold: Duration) -> String {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf);
            let chunk = "data: {\"type\":\"content_block_delta\",\"index\":0,\
                         \"delta\":{\"type\":\"text_delta\",\"text\":\"Jazz \"}}\n\n";
            let _ = socket.write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
            );
            let _ = socket.write_all(chunk.as_bytes());
            let _ = socket.flush();
            std::thread::sleep(hold);
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_stalled_stream_interrupts_generation() {
        let base = stalling_server(Duration::from_secs(10));
        let backend = AnthropicBackend::new(create_client().unwrap(), base, "k")
            .with_response_timeout(Duration::from_millis(300));
        let generator = StreamingGenerator::new(
            Arc::new(backend),
            RetryPolicy::default(),
            GenerationParams::default(),
        );

        let mut fragments = generator.generate("hi").await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            let first = fragments.next().await;
            let second = fragments.next().await;
            (first, second)
        })
        .await
        .expect("stalled stream must end on its own");

        assert_eq!(outcome.0, Some(Ok("Jazz ".to_string())));
        assert_eq!(
            outcome.1,
            Some(Err(GenerationError::Interrupted(BackendError::Timeout(
                Duration::from_millis(300)
            ))))
        );
    }
}
