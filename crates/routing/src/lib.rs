//! Envelope → agent routing via binding rules.

pub mod router;

pub use router::{chat_type, RouteDecision, Router};
