//! Control-plane protocol: one JSON frame per request over a WebSocket.
//!
//! The first frame after connection must be a typed [`ClientFrame::Hello`];
//! any other first frame closes the connection.  Every request carries an
//! idempotency key so retries are safe against the gateway's short-lived
//! dedup cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sb_domain::envelope::Envelope;
use sb_domain::error::RunStatus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client → gateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Typed handshake; must be the first frame.
    #[serde(rename = "hello")]
    Hello {
        client: String,
        version: String,
    },

    /// One request per frame.
    #[serde(rename = "request")]
    Request {
        /// Correlates the response frame.
        id: String,
        /// Retries reuse the same key; the gateway dedups.
        idempotency_key: String,
        #[serde(flatten)]
        method: Method,
    },
}

/// Control-plane methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Method {
    /// Accept an inbound envelope; responds `{ run_id, accepted_at }`
    /// synchronously and streams run events afterwards.
    #[serde(rename = "agent")]
    Agent { envelope: Envelope },

    /// Block until the run's terminal lifecycle event.
    #[serde(rename = "agent.wait")]
    AgentWait {
        run_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    #[serde(rename = "sessions.list")]
    SessionsList {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },

    #[serde(rename = "sessions.history")]
    SessionsHistory {
        session_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default)]
        include_tools: bool,
    },

    /// Agent-to-agent messaging: synthesize a job on another session and
    /// wait for its reply.
    #[serde(rename = "sessions.send")]
    SessionsSend {
        session_key: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },

    #[serde(rename = "health")]
    Health,

    #[serde(rename = "status")]
    Status,

    #[serde(rename = "system-presence")]
    SystemPresence,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway → client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Handshake accepted.
    #[serde(rename = "welcome")]
    Welcome {
        server: String,
        version: String,
    },

    #[serde(rename = "response")]
    Response {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A streamed run event.
    #[serde(rename = "event")]
    Event {
        #[serde(flatten)]
        event: RunEvent,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Start,
    Update,
    End,
}

/// Events published on the bus and mirrored to control-plane subscribers.
/// For one run the order is always `lifecycle start` … deltas …
/// `lifecycle end|error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RunEvent {
    #[serde(rename = "lifecycle")]
    Lifecycle {
        run_id: Uuid,
        phase: LifecyclePhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<RunStatus>,
        /// Terminal wire code: `ok`, `cancelled`, `error:<kind>`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant { run_id: Uuid, text: String },

    #[serde(rename = "reasoning")]
    Reasoning { run_id: Uuid, text: String },

    #[serde(rename = "tool")]
    Tool {
        run_id: Uuid,
        call_id: String,
        tool_name: String,
        phase: ToolPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },

    #[serde(rename = "compaction")]
    Compaction {
        run_id: Uuid,
        session_id: String,
        summary_chars: usize,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Lifecycle { run_id, .. }
            | Self::Assistant { run_id, .. }
            | Self::Reasoning { run_id, .. }
            | Self::Tool { run_id, .. }
            | Self::Compaction { run_id, .. } => *run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Lifecycle { phase: LifecyclePhase::End | LifecyclePhase::Error, .. }
        )
    }

    /// Terminal `error` lifecycle event with a classified kind.
    pub fn terminal_error(run_id: Uuid, kind: sb_domain::error::ErrorKind, message: String) -> Self {
        Self::Lifecycle {
            run_id,
            phase: LifecyclePhase::Error,
            status: Some(RunStatus::Error),
            code: Some(kind.wire_code().to_owned()),
            error: Some(message),
        }
    }

    /// Terminal lifecycle event for a finished run.
    pub fn terminal(run_id: Uuid, status: RunStatus, error: Option<String>) -> Self {
        let (phase, code) = match status {
            RunStatus::Ok => (LifecyclePhase::End, "ok".to_owned()),
            RunStatus::Cancelled => (LifecyclePhase::Error, "cancelled".to_owned()),
            RunStatus::Timeout => (LifecyclePhase::Error, "error:timeout".to_owned()),
            _ => (
                LifecyclePhase::Error,
                error
                    .as_deref()
                    .and_then(extract_code)
                    .unwrap_or("error:internal")
                    .to_owned(),
            ),
        };
        Self::Lifecycle { run_id, phase, status: Some(status), code: Some(code), error }
    }
}

fn extract_code(error: &str) -> Option<&'static str> {
    const CODES: &[&str] = &[
        "error:auth",
        "error:rate_limit",
        "error:timeout",
        "error:provider_transient",
        "error:provider_fatal",
        "error:bad_request",
        "error:billing_exhausted",
        "error:internal",
    ];
    CODES.iter().find(|code| error.starts_with(&code["error:".len()..])).copied()
}

/// Result of `agent.wait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResult {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
