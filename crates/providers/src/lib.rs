//! The model-layer seam: the streaming provider trait, per-request retry
//! with backoff, failure classification, and auth-profile rotation.

pub mod profiles;
pub mod retry;
pub mod scripted;
pub mod traits;

pub use profiles::ProfileRegistry;
pub use retry::RetryEngine;
pub use scripted::{ScriptedProvider, ScriptedTurn};
pub use traits::{is_transient_message, ChatRequest, LlmProvider, ProviderFailure};
