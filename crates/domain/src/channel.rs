//! The channel-connector contract.
//!
//! A connector owns one wire protocol (Telegram, Discord, Matrix, …).  The
//! core never speaks a wire protocol itself; it hands the connector shaped
//! text chunks and receives normalized envelopes through the inbound
//! callback registered at connect time.

use async_trait::async_trait;

use crate::envelope::Peer;
use crate::error::Result;

/// How a channel prefers its outbound text split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Split purely on length windows.
    #[default]
    Length,
    /// Prefer newline boundaries even when a longer chunk would fit.
    NewlinePreferred,
}

/// Result of a connector send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub ok: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl SendReceipt {
    pub fn ok(message_id: impl Into<String>) -> Self {
        Self { ok: true, message_id: Some(message_id.into()), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { ok: false, message_id: None, error: Some(error.into()) }
    }
}

/// One outbound text chunk, already rendered for the channel's flavor.
#[derive(Debug, Clone)]
pub struct OutboundChunk {
    pub text: String,
    /// Message to auto-reply to (first chunk only, when threading is on).
    pub reply_to: Option<String>,
}

/// A transport adapter presented to the core.
///
/// `text_chunk_limit` is a hard per-message cap; the delivery shaper never
/// hands a connector a chunk longer than this.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Connector name; matches `Envelope::channel`.
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Deliver one chunk to a peer.
    async fn send(&self, peer: &Peer, chunk: OutboundChunk) -> Result<SendReceipt>;

    /// Show a typing indicator, if the surface supports one.
    async fn send_typing(&self, _peer: &Peer) -> Result<()> {
        Ok(())
    }

    /// Maximum characters per outbound message on this surface.
    fn text_chunk_limit(&self) -> usize;

    fn chunk_mode(&self) -> ChunkMode {
        ChunkMode::Length
    }
}
