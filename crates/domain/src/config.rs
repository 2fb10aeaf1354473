use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    /// Agent definitions (key = agent_id).
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    /// The agent that takes unmatched envelopes.
    #[serde(default = "d_default_agent")]
    pub default_agent: String,
    /// Binding rules, most-specific-first at evaluation time; ties on equal
    /// specificity resolve by declaration order.
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// Per-channel delivery and queue overrides (key = channel name).
    #[serde(default)]
    pub channels: HashMap<String, ChannelOverrides>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub pruning: PruningConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

fn d_default_agent() -> String {
    "main".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// TTL for the control-plane idempotency cache.
    #[serde(default = "d_idem_ttl")]
    pub idempotency_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            idempotency_ttl_secs: d_idem_ttl(),
        }
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8787
}
fn d_idem_ttl() -> u64 {
    300
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Workspace directory holding the bootstrap files.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub dm_scope: DmScope,
    /// Primary model (e.g. `"anthropic/claude-sonnet-4"`).
    #[serde(default)]
    pub model: Option<String>,
    /// Fallback models, tried in order after the primary fails terminally.
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// Hard deadline for one agent run.
    #[serde(default = "d_run_timeout")]
    pub run_timeout_secs: u64,
    /// Whether reasoning deltas are forwarded to subscribers and included
    /// in final payloads.
    #[serde(default)]
    pub reasoning: ReasoningVisibility,
    /// Include a tool summary in the final payload.
    #[serde(default)]
    pub verbose_tool_summary: bool,
    /// Global lane this agent's runs dispatch through.
    #[serde(default = "d_lane_main")]
    pub lane: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            dm_scope: DmScope::default(),
            model: None,
            fallbacks: Vec::new(),
            run_timeout_secs: d_run_timeout(),
            reasoning: ReasoningVisibility::default(),
            verbose_tool_summary: false,
            lane: d_lane_main(),
        }
    }
}

fn d_run_timeout() -> u64 {
    600
}
fn d_lane_main() -> String {
    "main".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningVisibility {
    #[default]
    Hidden,
    On,
}

/// DM session scoping: how direct chats fold into session keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    /// All DMs fold to the agent's main bucket.
    #[default]
    Main,
    PerPeer,
    PerChannelPeer,
    PerAccountChannelPeer,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bindings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A rule mapping inbound envelopes to an agent.  Specificity is derived
/// from which selectors are present: peer > guild > team > (channel,
/// account) > channel.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Binding {
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    pub agent_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a new arrival interacts with an active run on the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArrivalMode {
    Interrupt,
    Steer,
    Followup,
    #[default]
    Collect,
    SteerBacklog,
}

/// What to drop when a session's backlog overflows `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    #[default]
    Old,
    New,
    Summarize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Named global lanes and their concurrency caps.
    #[serde(default = "d_global_lanes")]
    pub global_lanes: HashMap<String, usize>,
    #[serde(default)]
    pub default_mode: ArrivalMode,
    /// Quiet period after a run ends before the merged followup starts.
    #[serde(default = "d_debounce_ms")]
    pub debounce_ms: u64,
    /// Maximum queued arrivals per session.
    #[serde(default = "d_queue_cap")]
    pub cap: usize,
    #[serde(default)]
    pub drop: DropPolicy,
    /// Inbound dedup TTL.
    #[serde(default = "d_dedup_ttl")]
    pub dedup_ttl_secs: u64,
    /// Maximum entries in the dedup set before LRU eviction.
    #[serde(default = "d_dedup_cap")]
    pub dedup_cap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            global_lanes: d_global_lanes(),
            default_mode: ArrivalMode::default(),
            debounce_ms: d_debounce_ms(),
            cap: d_queue_cap(),
            drop: DropPolicy::default(),
            dedup_ttl_secs: d_dedup_ttl(),
            dedup_cap: d_dedup_cap(),
        }
    }
}

fn d_global_lanes() -> HashMap<String, usize> {
    HashMap::from([("main".into(), 4), ("subagent".into(), 2), ("cron".into(), 1)])
}
fn d_debounce_ms() -> u64 {
    2000
}
fn d_queue_cap() -> usize {
    20
}
fn d_dedup_ttl() -> u64 {
    180
}
fn d_dedup_cap() -> usize {
    4096
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionsConfig {
    #[serde(default)]
    pub identity_links: Vec<IdentityLink>,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub send_policy: SendPolicyConfig,
}

/// Collapse the same person across channels: any listed raw peer ID maps
/// to the canonical identity before DM-scope key derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityLink {
    pub canonical: String,
    pub peer_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Daily reset boundary, host-local hour (0–23).
    #[serde(default)]
    pub daily_reset_hour: Option<u8>,
    /// IANA zone name for the daily boundary; `None` = UTC.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Sliding idle window.
    #[serde(default)]
    pub idle_minutes: Option<u32>,
    /// Per chat-type overrides: `dm`, `group`, `thread`.
    #[serde(default)]
    pub reset_by_type: HashMap<String, ResetOverride>,
    /// Per-channel overrides (take precedence over per-type).
    #[serde(default)]
    pub reset_by_channel: HashMap<String, ResetOverride>,
    /// Threads are exempt from idle expiry so thread replies stay coherent.
    #[serde(default = "d_true")]
    pub thread_idle_exempt: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            daily_reset_hour: None,
            timezone: None,
            idle_minutes: None,
            reset_by_type: HashMap::new(),
            reset_by_channel: HashMap::new(),
            thread_idle_exempt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResetOverride {
    #[serde(default)]
    pub daily_reset_hour: Option<u8>,
    #[serde(default)]
    pub idle_minutes: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPolicyMode {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SendPolicyConfig {
    #[serde(default)]
    pub default: SendPolicyMode,
    #[serde(default)]
    pub deny_groups: bool,
    #[serde(default)]
    pub channel_overrides: HashMap<String, SendPolicyMode>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pruning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PruningMode {
    Off,
    #[default]
    CacheTtl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningConfig {
    #[serde(default)]
    pub mode: PruningMode,
    /// Prompt-cache window: pruning only runs when the last model call on
    /// the session is older than this.
    #[serde(default = "d_prune_ttl")]
    pub ttl_secs: u64,
    /// Tool results after the Nth-from-last assistant turn are protected.
    #[serde(default = "d_keep_last")]
    pub keep_last_assistants: usize,
    #[serde(default = "d_min_prunable")]
    pub min_prunable_chars: usize,
    /// Soft-trim threshold as a ratio of the estimated context window.
    #[serde(default = "d_soft_ratio")]
    pub soft_trim_ratio: f64,
    /// Hard-clear threshold as a ratio of the estimated context window.
    #[serde(default = "d_hard_ratio")]
    pub hard_clear_ratio: f64,
    /// Estimated context window, in tokens.  Char estimates use 4 chars
    /// per token; deliberately approximate and cheap.
    #[serde(default = "d_window_tokens")]
    pub context_window_tokens: usize,
    #[serde(default)]
    pub soft_trim: SoftTrimConfig,
    #[serde(default)]
    pub hard_clear: HardClearConfig,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            mode: PruningMode::default(),
            ttl_secs: d_prune_ttl(),
            keep_last_assistants: d_keep_last(),
            min_prunable_chars: d_min_prunable(),
            soft_trim_ratio: d_soft_ratio(),
            hard_clear_ratio: d_hard_ratio(),
            context_window_tokens: d_window_tokens(),
            soft_trim: SoftTrimConfig::default(),
            hard_clear: HardClearConfig::default(),
        }
    }
}

fn d_prune_ttl() -> u64 {
    300
}
fn d_keep_last() -> usize {
    3
}
fn d_min_prunable() -> usize {
    2000
}
fn d_soft_ratio() -> f64 {
    0.02
}
fn d_hard_ratio() -> f64 {
    0.08
}
fn d_window_tokens() -> usize {
    200_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftTrimConfig {
    #[serde(default = "d_head_chars")]
    pub head_chars: usize,
    #[serde(default = "d_tail_chars")]
    pub tail_chars: usize,
}

impl Default for SoftTrimConfig {
    fn default() -> Self {
        Self { head_chars: d_head_chars(), tail_chars: d_tail_chars() }
    }
}

fn d_head_chars() -> usize {
    1500
}
fn d_tail_chars() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardClearConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_placeholder")]
    pub placeholder: String,
}

impl Default for HardClearConfig {
    fn default() -> Self {
        Self { enabled: true, placeholder: d_placeholder() }
    }
}

fn d_placeholder() -> String {
    "[old tool result cleared]".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_attempts")]
    pub attempts: u32,
    #[serde(default = "d_min_delay")]
    pub min_delay_ms: u64,
    #[serde(default = "d_max_delay")]
    pub max_delay_ms: u64,
    /// Multiplicative jitter factor applied to each computed delay.
    #[serde(default = "d_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: d_attempts(),
            min_delay_ms: d_min_delay(),
            max_delay_ms: d_max_delay(),
            jitter: d_jitter(),
        }
    }
}

fn d_attempts() -> u32 {
    3
}
fn d_min_delay() -> u64 {
    500
}
fn d_max_delay() -> u64 {
    30_000
}
fn d_jitter() -> f64 {
    0.3
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel overrides (delivery shaping)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Markup flavor the channel accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkupFlavor {
    Html,
    MarkdownLite,
    #[default]
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyThreading {
    #[default]
    Off,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelOverrides {
    #[serde(default)]
    pub flavor: MarkupFlavor,
    #[serde(default)]
    pub reply_threading: ReplyThreading,
    /// Arrival-mode override for this channel.
    #[serde(default)]
    pub mode: Option<ArrivalMode>,
    /// Inbound debounce window override.
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    /// Stream chunks out as they form instead of one final payload.
    #[serde(default)]
    pub block_streaming: bool,
    /// Parse markdown tables for this channel.
    #[serde(default)]
    pub parse_tables: bool,
    /// Topic-based surface: thread IDs suffix session keys with `:topic:`
    /// instead of `:thread:` and transcripts get topic-suffixed files.
    #[serde(default)]
    pub topic_threads: bool,
    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default)]
    pub coalesce: CoalesceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Emission is delayed until this floor unless forced by end-of-message.
    #[serde(default = "d_min_chars")]
    pub min_chars: usize,
    /// Hard bound, clamped by the connector's `text_chunk_limit`.
    #[serde(default = "d_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self { min_chars: d_min_chars(), max_chars: d_max_chars() }
    }
}

fn d_min_chars() -> usize {
    400
}
fn d_max_chars() -> usize {
    4000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceConfig {
    /// Flush after this much stream silence.
    #[serde(default = "d_idle_ms")]
    pub idle_ms: u64,
    /// Flush when the buffer reaches this size.
    #[serde(default = "d_max_chars")]
    pub max_chars: usize,
    /// Minimum-size floor preventing micro-flushes.
    #[serde(default = "d_floor_chars")]
    pub min_chars: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self { idle_ms: d_idle_ms(), max_chars: d_max_chars(), min_chars: d_floor_chars() }
    }
}

fn d_idle_ms() -> u64 {
    1000
}
fn d_floor_chars() -> usize {
    200
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Message bodies beginning with this sigil are commands.
    #[serde(default = "d_sigil")]
    pub sigil: String,
    /// Sender IDs allowed to run state-changing commands.
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Named access groups of sender IDs.
    #[serde(default)]
    pub access_groups: HashMap<String, Vec<String>>,
    /// Access groups granted command authorization.
    #[serde(default)]
    pub authorized_groups: Vec<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            sigil: d_sigil(),
            allow_from: Vec::new(),
            access_groups: HashMap::new(),
            authorized_groups: Vec::new(),
        }
    }
}

fn d_sigil() -> String {
    "/".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace bootstrap caps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Per-file char cap for injected workspace files.
    #[serde(default = "d_bootstrap_max")]
    pub bootstrap_max_chars: usize,
    /// Waiter default timeout for `agent.wait`.
    #[serde(default = "d_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            bootstrap_max_chars: d_bootstrap_max(),
            wait_timeout_secs: d_wait_timeout(),
        }
    }
}

fn d_bootstrap_max() -> usize {
    20_000
}
fn d_wait_timeout() -> u64 {
    30
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
