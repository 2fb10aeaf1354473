//! Shared error type used across all Switchboard crates.
//!
//! Terminal run outcomes carry an [`ErrorKind`] so every lifecycle `error`
//! event maps to exactly one wire code (`error:auth`, `error:rate_limit`, …).

use serde::{Deserialize, Serialize};

/// Shared error type used across all Switchboard crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("model {kind}: {message}")]
    Model { kind: ErrorKind, message: String },

    #[error("transport {channel}: {message}")]
    Transport { channel: String, message: String },

    #[error("markup parse: {0}")]
    MarkupParse(String),

    #[error("queue overflow on {session_key}")]
    QueueOverflow { session_key: String },

    #[error("store conflict: {0}")]
    StoreConflict(String),

    #[error("store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy propagated from the model layer.  Serialized form
/// matches the wire codes in the control-plane contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    RateLimit,
    Timeout,
    ProviderTransient,
    ProviderFatal,
    BadRequest,
    BillingExhausted,
    Internal,
}

impl ErrorKind {
    /// Whether the error should trigger auth-profile rotation + cooldown.
    pub fn rotates_profile(self) -> bool {
        matches!(self, Self::Auth | Self::RateLimit | Self::Timeout)
    }

    /// Whether the error is worth retrying at the HTTP layer.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::ProviderTransient)
    }

    /// The wire code carried on a terminal lifecycle event.
    pub fn wire_code(self) -> &'static str {
        match self {
            Self::Auth => "error:auth",
            Self::RateLimit => "error:rate_limit",
            Self::Timeout => "error:timeout",
            Self::ProviderTransient => "error:provider_transient",
            Self::ProviderFatal => "error:provider_fatal",
            Self::BadRequest => "error:bad_request",
            Self::BillingExhausted => "error:billing_exhausted",
            Self::Internal => "error:internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::ProviderTransient => "provider_transient",
            Self::ProviderFatal => "provider_fatal",
            Self::BadRequest => "bad_request",
            Self::BillingExhausted => "billing_exhausted",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Run states.  `Accepted` and `Running` are transient; the rest are
/// terminal and map 1:1 to lifecycle wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Accepted,
    Running,
    Ok,
    Error,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Error | Self::Timeout | Self::Cancelled)
    }
}
