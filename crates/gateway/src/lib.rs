//! Switchboard core: the in-process coordination layer between inbound
//! chat transports and the LLM agent runtime.  Routing, lane scheduling,
//! the agent run loop, event fan-out, delivery shaping, and the control
//! plane live here; wire protocols and model adapters plug in at the
//! seams.

pub mod api;
pub mod inbound;
pub mod outbound;
pub mod pruning;
pub mod runtime;
pub mod state;

pub use inbound::{InboundDecision, InboundPipeline};
pub use outbound::OutboundShaper;
pub use runtime::{
    AgentRunner, EventBus, GatewayHooks, HookRegistry, NoTools, ProviderSet, RunRecord, RunStore,
    ToolExecutor, SILENT_REPLY,
};
pub use state::AppState;
