//! Synchronous hook points.
//!
//! A typed registry is passed to components at construction; there is no
//! process-wide hook state.  Hooks observe the run lifecycle and may
//! transform tool results before they are persisted, but they never block
//! on I/O: they run inline on the run loop.

use std::sync::Arc;

use uuid::Uuid;

use sb_domain::envelope::Envelope;
use sb_domain::error::RunStatus;
use sb_domain::message::ToolCall;

/// Interception points offered by the gateway.  Default implementations
/// are no-ops so implementors override only what they need.
#[allow(unused_variables)]
pub trait GatewayHooks: Send + Sync {
    /// Process start, before any connector is wired.
    fn bootstrap(&self) {}

    /// A routed envelope was accepted into the pipeline.
    fn message_received(&self, envelope: &Envelope) {}

    /// Immediately before the first model call of a run.
    fn before_agent_start(&self, run_id: Uuid, session_key: &str) {}

    fn before_tool_call(&self, run_id: Uuid, call: &ToolCall) {}

    fn after_tool_call(&self, run_id: Uuid, call: &ToolCall, result: &str, is_error: bool) {}

    /// Transform a tool result before the transcript write.  Hooks chain:
    /// each receives the previous hook's output.
    fn tool_result_persist(&self, call: &ToolCall, payload: String) -> String {
        payload
    }

    /// Terminal lifecycle reached.
    fn agent_end(&self, run_id: Uuid, status: RunStatus, summary: &str) {}

    fn before_compaction(&self, session_id: &str) {}

    fn after_compaction(&self, session_id: &str, summary: &str) {}
}

/// An ordered set of hook implementations.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn GatewayHooks>>,
}

impl HookRegistry {
    pub fn new(hooks: Vec<Arc<dyn GatewayHooks>>) -> Self {
        Self { hooks }
    }

    pub fn fire_bootstrap(&self) {
        for hook in &self.hooks {
            hook.bootstrap();
        }
    }

    pub fn fire_message_received(&self, envelope: &Envelope) {
        for hook in &self.hooks {
            hook.message_received(envelope);
        }
    }

    pub fn fire_before_agent_start(&self, run_id: Uuid, session_key: &str) {
        for hook in &self.hooks {
            hook.before_agent_start(run_id, session_key);
        }
    }

    pub fn fire_before_tool_call(&self, run_id: Uuid, call: &ToolCall) {
        for hook in &self.hooks {
            hook.before_tool_call(run_id, call);
        }
    }

    pub fn fire_after_tool_call(
        &self,
        run_id: Uuid,
        call: &ToolCall,
        result: &str,
        is_error: bool,
    ) {
        for hook in &self.hooks {
            hook.after_tool_call(run_id, call, result, is_error);
        }
    }

    /// Chain every hook's transform over the payload.
    pub fn fire_tool_result_persist(&self, call: &ToolCall, payload: String) -> String {
        self.hooks
            .iter()
            .fold(payload, |acc, hook| hook.tool_result_persist(call, acc))
    }

    pub fn fire_agent_end(&self, run_id: Uuid, status: RunStatus, summary: &str) {
        for hook in &self.hooks {
            hook.agent_end(run_id, status, summary);
        }
    }

    pub fn fire_before_compaction(&self, session_id: &str) {
        for hook in &self.hooks {
            hook.before_compaction(session_id);
        }
    }

    pub fn fire_after_compaction(&self, session_id: &str, summary: &str) {
        for hook in &self.hooks {
            hook.after_compaction(session_id, summary);
        }
    }
}
