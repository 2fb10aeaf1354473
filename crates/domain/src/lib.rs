//! Shared domain types for the Switchboard gateway: configuration tree,
//! inbound envelope, prompt message model, streaming events, error
//! taxonomy, and the channel-connector contract.

pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod message;
pub mod stream;

pub use channel::{ChannelConnector, ChunkMode, OutboundChunk, SendReceipt};
pub use envelope::{Attachment, Envelope, Peer, PeerKind};
pub use error::{Error, ErrorKind, Result, RunStatus};
pub use message::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
pub use stream::{BoxStream, StreamEvent, Usage};
