//! # Streaming generation
//!
//! Turns a prompt into a lazy, forward-only stream of text fragments from a
//! remote chat-completion service, riding out rate limiting on the way.
//!
//! ```text
//!            generate()
//!   Idle ──────────────► Requesting ──accepted──► Streaming ──end──► Completed
//!                          ▲    │                    │
//!                  backoff │    │ throttled          │ throttled before first fragment
//!                          │    ▼                    ▼
//!                         Retrying ◄─────────────────┘
//!                              │ attempts == max_retries
//!                              ▼
//!                       FailedPermanently  ◄── any other error
//! ```
//!
//! Two machines are nested:
//!
//! - the **session** (outer) owns the attempt counter. A throttling signal
//!   waits `base_delay * 2^attempt + U[0, max_jitter)` and asks again; after
//!   `max_retries` consecutive throttles it gives up without another request.
//!   Anything else fails immediately.
//! - the **consumer** (inner) pulls raw events from the open stream and yields
//!   the text of every `content_block_delta`. Event types it does not care
//!   about and payloads it cannot parse are skipped. A throttle that arrives
//!   in-band before any text was yielded hands control back to the session;
//!   once text has gone out the stream cannot be restarted and ends with
//!   [`GenerationError::Interrupted`].
//!
//! The wire protocol itself (HTTP, SSE framing, auth) belongs to a
//! [`GenerationBackend`]; see [`crate::anthropic`].

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Raw event payloads (one JSON document each) from an open generation stream.
pub type EventStream = BoxStream<'static, Result<String, BackendError>>;

/// Failures reported by a [`GenerationBackend`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("throttled: {0}")]
    Throttled(String),

    #[error("status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    /// Only rate limiting is worth waiting out.
    pub fn is_throttling(&self) -> bool {
        matches!(self, BackendError::Throttled(_))
    }
}

/// Terminal outcomes of [`StreamingGenerator::generate`] and of the fragment stream.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Upstream(BackendError),

    #[error("generation still throttled after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: BackendError },

    #[error("generation stream broke off: {0}")]
    Interrupted(BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => f.write_str("system"),
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// What to send: a single user prompt or a prepared message list.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationInput {
    Prompt(String),
    Messages(Vec<ChatMessage>),
}

impl GenerationInput {
    pub fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            GenerationInput::Prompt(prompt) => vec![ChatMessage::user(prompt)],
            GenerationInput::Messages(messages) => messages,
        }
    }
}

impl From<String> for GenerationInput {
    fn from(prompt: String) -> Self {
        GenerationInput::Prompt(prompt)
    }
}

impl From<&str> for GenerationInput {
    fn from(prompt: &str) -> Self {
        GenerationInput::Prompt(prompt.to_string())
    }
}

impl From<Vec<ChatMessage>> for GenerationInput {
    fn from(messages: Vec<ChatMessage>) -> Self {
        GenerationInput::Messages(messages)
    }
}

/// Sampling settings sent with every request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

/// Model used when the configuration does not name one.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

/// A fully specified chat request, as handed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl GenerationParams {
    pub fn request(&self, input: GenerationInput) -> GenerationRequest {
        GenerationRequest {
            model: self.model.clone(),
            messages: input.into_messages(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

/// The remote side of generation: open a stream of raw events for a request.
///
/// Implementations report rate limiting as [`BackendError::Throttled`] and
/// everything else with the other variants; they do not retry on their own.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn open_stream(&self, request: &GenerationRequest) -> Result<EventStream, BackendError>;
}

/// Backoff schedule for throttled requests.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// `max_retries` is the total number of attempts (at least one).
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
            max_jitter: Duration::from_secs(1),
        }
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `base_delay * 2^attempt`, before jitter.
    pub fn backoff_floor(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
    }

    /// Wait before retrying after `attempt` (0-based) was throttled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(
                rand::thread_rng().gen_range(0.0..self.max_jitter.as_secs_f64()),
            )
        };
        self.backoff_floor(attempt).saturating_add(jitter)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    ContentBlockDelta { delta: WireDelta },
    Error { error: WireError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

/// What one raw payload means to the consumer.
#[derive(Debug, PartialEq)]
enum Decoded {
    Text(String),
    Skip,
    Failure(BackendError),
}

fn decode_event(payload: &str) -> Decoded {
    match serde_json::from_str::<WireEvent>(payload) {
        Ok(WireEvent::ContentBlockDelta { delta }) => match delta.text {
            Some(text) if !text.is_empty() => Decoded::Text(text),
            _ => Decoded::Skip,
        },
        Ok(WireEvent::Error { error }) if error.kind == "rate_limit_error" => {
            Decoded::Failure(BackendError::Throttled(error.message))
        }
        Ok(WireEvent::Error { error }) => Decoded::Failure(BackendError::Api {
            status: 0,
            message: format!("{}: {}", error.kind, error.message),
        }),
        Ok(WireEvent::Other) => Decoded::Skip,
        Err(e) => {
            debug!("Skipping malformed stream event ({}): {:.120}", e, payload);
            Decoded::Skip
        }
    }
}

/// Outer machine: request, back off on throttling, request again.
struct Session {
    backend: Arc<dyn GenerationBackend>,
    policy: RetryPolicy,
    request: GenerationRequest,
    attempt: u32,
}

impl Session {
    async fn connect(&mut self) -> Result<EventStream, GenerationError> {
        loop {
            debug!("Requesting generation stream, attempt {}", self.attempt + 1);
            let opened = self.backend.open_stream(&self.request).await;
            match opened {
                Ok(events) => return Ok(events),
                Err(err) if err.is_throttling() => self.back_off(err).await?,
                Err(err) => {
                    error!("Generation request failed: {}", err);
                    return Err(GenerationError::Upstream(err));
                }
            }
        }
    }

    async fn back_off(&mut self, err: BackendError) -> Result<(), GenerationError> {
        let attempts = self.attempt + 1;
        if attempts >= self.policy.max_retries {
            error!("Giving up after {} throttled attempts", attempts);
            return Err(GenerationError::RetriesExhausted {
                attempts,
                last: err,
            });
        }

        let wait = self.policy.delay_for(self.attempt);
        warn!("Throttled ({}). Retrying in {:.2}s", err, wait.as_secs_f64());
        tokio::time::sleep(wait).await;
        self.attempt = attempts;
        Ok(())
    }
}

/// Inner machine: drain one open stream into fragments.
struct Consumer {
    session: Session,
    events: Option<EventStream>,
    emitted: bool,
}

impl Consumer {
    async fn next_fragment(&mut self) -> Option<Result<String, GenerationError>> {
        loop {
            let next = self.events.as_mut()?.next().await;
            let failure = match next {
                None => {
                    debug!("Generation stream completed");
                    self.events = None;
                    return None;
                }
                Some(Ok(payload)) => match decode_event(&payload) {
                    Decoded::Text(text) => {
                        self.emitted = true;
                        return Some(Ok(text));
                    }
                    Decoded::Skip => continue,
                    Decoded::Failure(err) => err,
                },
                Some(Err(err)) => err,
            };

            // Drop the broken stream before doing anything else with the connection.
            self.events = None;

            if failure.is_throttling() && !self.emitted {
                if let Err(e) = self.session.back_off(failure).await {
                    return Some(Err(e));
                }
                match self.session.connect().await {
                    Ok(events) => {
                        self.events = Some(events);
                        continue;
                    }
                    Err(e) => return Some(Err(e)),
                }
            }

            warn!("Generation stream interrupted: {}", failure);
            return Some(Err(GenerationError::Interrupted(failure)));
        }
    }
}

/// Lazy sequence of text fragments in upstream order.
///
/// Single consumer, forward only. Dropping it closes the upstream stream; no
/// further events are read.
pub struct FragmentStream {
    inner: BoxStream<'static, Result<String, GenerationError>>,
}

impl FragmentStream {
    fn consume(session: Session, events: EventStream) -> Self {
        let consumer = Consumer {
            session,
            events: Some(events),
            emitted: false,
        };
        let inner = stream::unfold(consumer, |mut consumer| async move {
            let item = consumer.next_fragment().await?;
            Some((item, consumer))
        })
        .boxed();
        Self { inner }
    }

    /// Drain the stream into one string, stopping at the first error.
    pub async fn collect_text(mut self) -> Result<String, GenerationError> {
        let mut text = String::new();
        while let Some(fragment) = self.inner.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Stream for FragmentStream {
    type Item = Result<String, GenerationError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Sends requests through a [`GenerationBackend`] under a [`RetryPolicy`].
#[derive(Clone)]
pub struct StreamingGenerator {
    backend: Arc<dyn GenerationBackend>,
    policy: RetryPolicy,
    params: GenerationParams,
}

impl StreamingGenerator {
    pub fn new(backend: Arc<dyn GenerationBackend>, policy: RetryPolicy, params: GenerationParams) -> Self {
        Self {
            backend,
            policy,
            params,
        }
    }

    /// Open a generation stream for `input`.
    ///
    /// Resolves once the service has accepted the request, possibly after
    /// several throttled attempts; fragments are then pulled from the returned
    /// stream as they arrive.
    ///
    /// # Errors
    /// - [`GenerationError::RetriesExhausted`] after `max_retries` throttles.
    /// - [`GenerationError::Upstream`] on any other backend error.
    pub async fn generate(
        &self,
        input: impl Into<GenerationInput>,
    ) -> Result<FragmentStream, GenerationError> {
        let mut session = Session {
            backend: Arc::clone(&self.backend),
            policy: self.policy.clone(),
            request: self.params.request(input.into()),
            attempt: 0,
        };

        let events = session.connect().await?;
        info!(
            "Generation stream opened on attempt {} ({})",
            session.attempt + 1,
            session.request.model
        );
        Ok(FragmentStream::consume(session, events))
    }
}
