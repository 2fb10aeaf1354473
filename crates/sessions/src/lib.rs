//! Session-state management: persistent `sessionKey → SessionEntry` maps,
//! append-only JSONL transcripts, reset lifecycle, key computation, and
//! identity linking.

pub mod identity;
pub mod lifecycle;
pub mod session_key;
pub mod store;
pub mod transcript;

pub use identity::IdentityResolver;
pub use lifecycle::{LifecycleManager, ResetReason};
pub use session_key::{compute_session_key, normalize_key};
pub use store::{MintSeed, SessionEntry, SessionOrigin, SessionStore};
pub use transcript::{args_hash, TranscriptTurn, TranscriptWriter, TurnKind};
