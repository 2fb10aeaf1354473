//! The provider seam.
//!
//! The gateway never talks to a model API directly; it hands a
//! [`ChatRequest`] to an [`LlmProvider`] and consumes the provider-agnostic
//! event stream.  Concrete wire adapters live outside the core.

use async_trait::async_trait;

use sb_domain::error::{Error, ErrorKind};
use sb_domain::message::{Message, ToolDefinition};
use sb_domain::stream::{BoxStream, StreamEvent};

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature.  `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response.  `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Model identifier (e.g. `"anthropic/claude-sonnet-4"`).  `None` uses
    /// the provider default.
    pub model: Option<String>,
    /// Auth profile chosen for this call (session stickiness).
    pub profile_id: Option<String>,
}

/// A structured model-layer failure, classified before it surfaces.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Provider-supplied backoff hint (e.g. a `Retry-After` header).
    pub retry_after: Option<std::time::Duration>,
}

impl ProviderFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after: None }
    }

    pub fn with_retry_after(mut self, retry_after: std::time::Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Map an HTTP status + body to the failure taxonomy.
    pub fn classify_http(status: u16, message: &str) -> ErrorKind {
        match status {
            401 | 403 => ErrorKind::Auth,
            402 => ErrorKind::BillingExhausted,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            400 | 404 | 422 => ErrorKind::BadRequest,
            500..=599 => ErrorKind::ProviderTransient,
            _ if is_transient_message(message) => ErrorKind::ProviderTransient,
            _ => ErrorKind::ProviderFatal,
        }
    }
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProviderFailure {}

impl From<ProviderFailure> for Error {
    fn from(failure: ProviderFailure) -> Self {
        Error::Model { kind: failure.kind, message: failure.message }
    }
}

/// Message patterns that mark a failure as transient regardless of code.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["temporarily unavailable", "connection reset", "timed out", "timeout", "overloaded"]
        .iter()
        .any(|p| lower.contains(p))
}

/// A streaming chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name, used in logs and profile bookkeeping.
    fn name(&self) -> &str;

    /// Start a streaming completion.  Stream items surface mid-stream
    /// failures as `Err(ProviderFailure)`.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent, ProviderFailure>>, ProviderFailure>;
}
