//! The agent runner: accepts a dispatched job, assembles the prompt,
//! drives the model stream, fans events out on the bus, dispatches tools,
//! and persists transcript turns.
//!
//! The runner implements the queue's [`JobDispatcher`] seam.  Cancellation
//! (user stop, interrupt, deadline) arrives through the job's cancel token
//! and is honored at every delta boundary; steering text arrives through
//! the handle's inbox and is injected at the next tool-call boundary.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;

use sb_domain::config::Config;
use sb_domain::error::{ErrorKind, RunStatus};
use sb_domain::message::{Message, ToolCall, ToolDefinition};
use sb_domain::stream::{StreamEvent, Usage};
use sb_providers::{ChatRequest, LlmProvider, ProfileRegistry, ProviderFailure};
use sb_queue::{Job, JobDispatcher, RunHandle};
use sb_sessions::{
    args_hash, MintSeed, SessionEntry, SessionOrigin, SessionStore, TranscriptWriter, TurnKind,
};
use sb_protocol::{LifecyclePhase, RunEvent, ToolPhase};

use crate::pruning;
use crate::runtime::bootstrap::load_bootstrap;
use crate::runtime::events::EventBus;
use crate::runtime::hooks::HookRegistry;
use crate::runtime::prompt::{compose_system_prompt, PromptInputs};
use crate::runtime::runs::RunRecord;
use crate::runtime::truncate_str;

/// Hard stop for runaway tool loops.
const MAX_TOOL_LOOPS: usize = 25;

/// Persisted tool payloads are truncated beyond this.
const MAX_TOOL_PERSIST_CHARS: usize = 64 * 1024;

/// Result text injected for tool calls skipped by steering.
const STEER_SKIP_RESULT: &str = "skipped due to queued user message";

/// Assistant replies equal to this sentinel suppress channel delivery.
pub const SILENT_REPLY: &str = "NO_REPLY";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool execution is external to the core; the runner only sequences calls
/// and persists results.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Returns `(payload, is_error)`.
    async fn execute(&self, call: &ToolCall) -> (String, bool);
}

/// Default executor: no tools are offered.
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(&self, call: &ToolCall) -> (String, bool) {
        (format!("tool not available: {}", call.tool_name), true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maps a model string's provider prefix (`"anthropic/…"`) to a backend.
pub struct ProviderSet {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default: Arc<dyn LlmProvider>,
}

impl ProviderSet {
    pub fn new(default: Arc<dyn LlmProvider>) -> Self {
        Self { providers: HashMap::new(), default }
    }

    pub fn with_provider(mut self, prefix: &str, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.insert(prefix.to_owned(), provider);
        self
    }

    pub fn resolve(&self, model: Option<&str>) -> Arc<dyn LlmProvider> {
        model
            .and_then(|m| m.split('/').next())
            .and_then(|prefix| self.providers.get(prefix))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentRunner {
    config: Arc<Config>,
    sessions: Arc<SessionStore>,
    events: Arc<EventBus>,
    hooks: HookRegistry,
    providers: ProviderSet,
    tools: Arc<dyn ToolExecutor>,
    /// agent_id → transcript writer over its sessions directory.
    writers: Mutex<HashMap<String, Arc<TranscriptWriter>>>,
    /// agent_id → auth-profile registry.
    profiles: Mutex<HashMap<String, Arc<ProfileRegistry>>>,
    profile_ids: Vec<String>,
}

impl AgentRunner {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionStore>,
        events: Arc<EventBus>,
        hooks: HookRegistry,
        providers: ProviderSet,
        tools: Arc<dyn ToolExecutor>,
        profile_ids: Vec<String>,
    ) -> Self {
        Self {
            config,
            sessions,
            events,
            hooks,
            providers,
            tools,
            writers: Mutex::new(HashMap::new()),
            profiles: Mutex::new(HashMap::new()),
            profile_ids,
        }
    }

    pub fn transcripts(&self, agent_id: &str) -> Arc<TranscriptWriter> {
        let mut writers = self.writers.lock();
        writers
            .entry(agent_id.to_owned())
            .or_insert_with(|| {
                Arc::new(TranscriptWriter::new(&self.sessions.sessions_dir(agent_id)))
            })
            .clone()
    }

    fn profile_registry(&self, agent_id: &str) -> Arc<ProfileRegistry> {
        let mut profiles = self.profiles.lock();
        profiles
            .entry(agent_id.to_owned())
            .or_insert_with(|| {
                let path = self
                    .sessions
                    .sessions_dir(agent_id)
                    .parent()
                    .map(|p| p.join("profiles.json"))
                    .unwrap_or_else(|| "profiles.json".into());
                Arc::new(ProfileRegistry::load(&path, &self.profile_ids))
            })
            .clone()
    }

    fn publish(&self, event: RunEvent) {
        self.events.publish(event);
    }

    fn persist(&self, agent_id: &str, session_id: &str, topic: Option<&str>, kind: TurnKind) {
        if let Err(e) = self
            .transcripts(agent_id)
            .append(session_id, topic, vec![(Utc::now(), kind)])
        {
            tracing::warn!(session_id, error = %e, "transcript append failed");
        }
    }

    /// Resolve (or mint) the session entry for a job.
    fn resolve_session(&self, job: &Job) -> SessionEntry {
        let envelope = &job.envelope;
        let seed = MintSeed {
            display_name: envelope.sender_name.clone(),
            channel: envelope.channel.clone(),
            chat_type: match envelope.peer.kind {
                sb_domain::envelope::PeerKind::Direct => "dm".into(),
                sb_domain::envelope::PeerKind::Thread => "thread".into(),
                _ => "group".into(),
            },
            origin: SessionOrigin {
                label: envelope.sender_name.clone(),
                provider: Some(envelope.channel.clone()),
                from: Some(envelope.sender_id.clone()),
                to: Some(envelope.peer.id.clone()),
                account_id: Some(envelope.account_id.clone()),
                thread_id: envelope
                    .parent_peer
                    .as_ref()
                    .map(|_| envelope.peer.id.clone()),
            },
        };
        let (entry, is_new) = self
            .sessions
            .resolve_or_create(&job.agent_id, &job.session_key, seed);

        if is_new {
            // Header turn; thread forks carry a pointer to the containing
            // conversation's session.
            let parent_session = self.parent_session_of(job);
            self.persist(
                &job.agent_id,
                &entry.session_id,
                None,
                TurnKind::SystemNote { content: "session started".into(), parent_session },
            );
        }
        entry
    }

    /// For a thread-forked session, the session ID of the containing
    /// group/room conversation, if one exists.
    fn parent_session_of(&self, job: &Job) -> Option<String> {
        let parent = job.envelope.parent_peer.as_ref()?;
        let mut parent_env = job.envelope.clone();
        parent_env.peer = parent.clone();
        parent_env.parent_peer = None;

        let dm_scope = self
            .config
            .agents
            .get(&job.agent_id)
            .map(|a| a.dm_scope)
            .unwrap_or_default();
        let topic_style = self
            .config
            .channels
            .get(&job.envelope.channel)
            .map(|c| c.topic_threads)
            .unwrap_or(false);
        let parent_key = sb_sessions::compute_session_key(
            &job.agent_id,
            dm_scope,
            &parent_env,
            &job.envelope.sender_id,
            topic_style,
        );
        self.sessions
            .get(&job.agent_id, &parent_key)
            .map(|e| e.session_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl JobDispatcher for AgentRunner {
    async fn dispatch(&self, job: Job, mut handle: RunHandle) -> RunStatus {
        let entry = self.resolve_session(&job);

        // Ensure a run record exists (control-plane submissions insert one
        // at acceptance; connector submissions may not have).
        if self.events.run_store().get(&job.run_id).is_none() {
            let mut record = RunRecord::new(
                job.run_id,
                job.session_key.clone(),
                entry.session_id.clone(),
                job.agent_id.clone(),
                job.accepted_at,
                &job.body,
            );
            record.parent_run_id = job.parent_run_id;
            self.events.run_store().insert(record);
        } else {
            let session_id = entry.session_id.clone();
            self.events.run_store().update(&job.run_id, |r| {
                r.session_id = session_id;
            });
        }

        let outcome = self.run_inner(&job, &mut handle, &entry).await;

        let status = match outcome {
            Ok(RunOutcome { status, final_text, usage }) => {
                self.events.run_store().update(&job.run_id, |r| {
                    r.input_tokens = usage.prompt_tokens;
                    r.output_tokens = usage.completion_tokens;
                    r.total_tokens = usage.total_tokens;
                    r.output_preview = Some(truncate_str(&final_text, 200));
                    r.final_text = Some(final_text.clone());
                });
                self.sessions.record_usage(
                    &job.agent_id,
                    &job.session_key,
                    usage.prompt_tokens as u64,
                    usage.completion_tokens as u64,
                );
                self.publish(RunEvent::terminal(job.run_id, status, None));
                self.hooks.fire_agent_end(job.run_id, status, &final_text);
                status
            }
            Err(failure) => {
                tracing::warn!(
                    run_id = %job.run_id,
                    kind = %failure.kind,
                    error = %failure.message,
                    "run failed"
                );
                self.publish(RunEvent::terminal_error(
                    job.run_id,
                    failure.kind,
                    format!("{}: {}", failure.kind, failure.message),
                ));
                self.hooks.fire_agent_end(job.run_id, RunStatus::Error, &failure.message);
                RunStatus::Error
            }
        };

        // Terminal activity advances the session clock either way.
        self.sessions.touch(&job.agent_id, &job.session_key);
        status
    }

    async fn expired(&self, job: Job) {
        let entry = self.resolve_session(&job);
        if self.events.run_store().get(&job.run_id).is_none() {
            self.events.run_store().insert(RunRecord::new(
                job.run_id,
                job.session_key.clone(),
                entry.session_id,
                job.agent_id.clone(),
                job.accepted_at,
                &job.body,
            ));
        }
        self.publish(RunEvent::terminal(job.run_id, RunStatus::Timeout, None));
        self.sessions.touch(&job.agent_id, &job.session_key);
    }
}

struct RunOutcome {
    status: RunStatus,
    final_text: String,
    usage: Usage,
}

impl AgentRunner {
    async fn run_inner(
        &self,
        job: &Job,
        handle: &mut RunHandle,
        entry: &SessionEntry,
    ) -> Result<RunOutcome, ProviderFailure> {
        let agent_cfg = self.config.agents.get(&job.agent_id).cloned().unwrap_or_default();
        let channel_cfg = self.config.channels.get(&job.envelope.channel);

        // 1. Model + auth profile, with session stickiness.
        let registry = self.profile_registry(&job.agent_id);
        let profile = registry.select(entry.last_profile_id.as_deref(), Utc::now());
        if let Some(ref profile) = profile {
            let profile = profile.clone();
            self.sessions.update(&job.agent_id, &job.session_key, |e| {
                e.last_profile_id = Some(profile.clone());
            });
        }
        let model = agent_cfg.model.clone();
        let provider = self.providers.resolve(model.as_deref());

        // 2. Bootstrap files + hook.
        let bootstrap = load_bootstrap(
            agent_cfg.workspace.as_deref(),
            self.config.context.bootstrap_max_chars,
        );
        self.hooks.fire_before_agent_start(job.run_id, &job.session_key);

        // 3. System prompt, fixed section order.
        let tool_defs = self.tools.definitions();
        let system_prompt = compose_system_prompt(&PromptInputs {
            agent_id: &job.agent_id,
            tools: &tool_defs,
            skills: &[],
            self_update_notes: None,
            workspace_path: agent_cfg.workspace.as_deref().and_then(|p| p.to_str()),
            docs_pointer: None,
            bootstrap: &bootstrap,
            sandboxed: false,
            timezone: self.config.sessions.lifecycle.timezone.as_deref(),
            heartbeat_directives: None,
            channel: &job.envelope.channel,
            reasoning: agent_cfg.reasoning,
        });

        // 4. History + pruning.
        let topic = topic_of(job, channel_cfg.map(|c| c.topic_threads).unwrap_or(false));
        let history = self.load_history(&job.agent_id, &entry.session_id, topic.as_deref());
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(&system_prompt));
        messages.extend(history);

        if pruning::prune_due(&self.config.pruning, entry.last_model_call_at, Utc::now()) {
            let before = messages.len();
            messages = pruning::prune_messages(&messages, &self.config.pruning);
            tracing::debug!(
                session_id = %entry.session_id,
                turns = before,
                "context pruned before model call"
            );
        }

        messages.push(Message::user(&job.body));
        self.persist(
            &job.agent_id,
            &entry.session_id,
            topic.as_deref(),
            TurnKind::User {
                content: job.body.clone(),
                sender: job.envelope.sender_name.clone(),
            },
        );

        // 5. Model loop.
        let mut total_usage = Usage::default();
        let mut started = false;
        let mut used_tools: Vec<String> = Vec::new();
        let reasoning_visible =
            agent_cfg.reasoning == sb_domain::config::ReasoningVisibility::On;

        for loop_idx in 0..MAX_TOOL_LOOPS {
            if let Some(reason) = handle.cancel.reason() {
                return Ok(RunOutcome {
                    status: reason.status(),
                    final_text: String::new(),
                    usage: total_usage,
                });
            }

            let request = ChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
                temperature: None,
                max_tokens: None,
                model: model.clone(),
                profile_id: profile.clone(),
            };

            let stream = tokio::select! {
                stream = provider.chat_stream(&request) => stream,
                _ = handle.cancel.cancelled() => {
                    let status = handle
                        .cancel
                        .reason()
                        .map(|r| r.status())
                        .unwrap_or(RunStatus::Cancelled);
                    return Ok(RunOutcome {
                        status,
                        final_text: String::new(),
                        usage: total_usage,
                    });
                }
            };

            let mut stream = match stream {
                Ok(stream) => stream,
                Err(failure) => {
                    if registry.report_failure(
                        profile.as_deref().unwrap_or("default"),
                        failure.kind,
                        Utc::now(),
                    ) {
                        tracing::info!(run_id = %job.run_id, "auth profile rotated");
                    }
                    return Err(failure);
                }
            };

            self.sessions
                .mark_model_call(&job.agent_id, &job.session_key, Utc::now());

            if !started {
                started = true;
                self.publish(RunEvent::Lifecycle {
                    run_id: job.run_id,
                    phase: LifecyclePhase::Start,
                    status: Some(RunStatus::Running),
                    code: None,
                    error: None,
                });
            }
            handle.streaming.store(true, Ordering::Release);

            // Consume the stream.
            let mut text_buf = String::new();
            let mut reasoning_buf = String::new();
            let mut pending_tool_calls: Vec<ToolCall> = Vec::new();
            let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();
            let mut turn_usage: Option<Usage> = None;

            loop {
                let event = tokio::select! {
                    event = stream.next() => event,
                    _ = handle.cancel.cancelled() => {
                        // Drop in-flight content after the current delta.
                        let status = handle
                            .cancel
                            .reason()
                            .map(|r| r.status())
                            .unwrap_or(RunStatus::Cancelled);
                        self.persist_partial(job, entry, topic.as_deref(), &text_buf);
                        return Ok(RunOutcome {
                            status,
                            final_text: text_buf,
                            usage: total_usage,
                        });
                    }
                };
                let Some(event) = event else { break };
                match event {
                    Ok(StreamEvent::Thinking { text }) => {
                        if reasoning_visible {
                            self.publish(RunEvent::Reasoning {
                                run_id: job.run_id,
                                text: text.clone(),
                            });
                        }
                        reasoning_buf.push_str(&text);
                    }
                    Ok(StreamEvent::Token { text }) => {
                        self.publish(RunEvent::Assistant {
                            run_id: job.run_id,
                            text: text.clone(),
                        });
                        text_buf.push_str(&text);
                    }
                    Ok(StreamEvent::ToolCallStarted { call_id, tool_name }) => {
                        self.publish(RunEvent::Tool {
                            run_id: job.run_id,
                            call_id: call_id.clone(),
                            tool_name: tool_name.clone(),
                            phase: ToolPhase::Start,
                            payload: None,
                        });
                        tc_bufs.insert(call_id, (tool_name, String::new()));
                    }
                    Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                        if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                            args.push_str(&delta);
                        }
                    }
                    Ok(StreamEvent::ToolCallFinished { call_id, tool_name, arguments }) => {
                        tc_bufs.remove(&call_id);
                        pending_tool_calls.push(ToolCall { call_id, tool_name, arguments });
                    }
                    Ok(StreamEvent::Done { usage, .. }) => {
                        turn_usage = usage;
                    }
                    Ok(StreamEvent::Error { message }) => {
                        return Err(ProviderFailure::new(
                            if sb_providers::is_transient_message(&message) {
                                ErrorKind::ProviderTransient
                            } else {
                                ErrorKind::ProviderFatal
                            },
                            message,
                        ));
                    }
                    Err(failure) => {
                        registry.report_failure(
                            profile.as_deref().unwrap_or("default"),
                            failure.kind,
                            Utc::now(),
                        );
                        return Err(failure);
                    }
                }
            }

            // Providers that only send start/delta still yield complete calls.
            for (call_id, (name, args)) in tc_bufs.drain() {
                let arguments = serde_json::from_str(&args).unwrap_or(Value::Object(Default::default()));
                pending_tool_calls.push(ToolCall { call_id, tool_name: name, arguments });
            }

            if let Some(usage) = &turn_usage {
                total_usage.accumulate(usage);
            }
            if let Some(profile) = &profile {
                registry.report_success(profile);
            }

            // Natural end of the run.
            if pending_tool_calls.is_empty() {
                self.persist(
                    &job.agent_id,
                    &entry.session_id,
                    topic.as_deref(),
                    TurnKind::Assistant {
                        content: text_buf.clone(),
                        reasoning: reasoning_visible.then(|| reasoning_buf.clone()),
                        tool_calls: Vec::new(),
                    },
                );
                self.maybe_compact(job, entry, topic.as_deref());

                let final_text = compose_final_payload(
                    text_buf,
                    &used_tools,
                    agent_cfg.verbose_tool_summary,
                    reasoning_visible.then_some(reasoning_buf.as_str()),
                );
                return Ok(RunOutcome {
                    status: RunStatus::Ok,
                    final_text,
                    usage: total_usage,
                });
            }

            // Tool boundary: persist the assistant turn with its calls.
            self.persist(
                &job.agent_id,
                &entry.session_id,
                topic.as_deref(),
                TurnKind::Assistant {
                    content: text_buf.clone(),
                    reasoning: reasoning_visible.then(|| reasoning_buf.clone()),
                    tool_calls: pending_tool_calls.clone(),
                },
            );
            messages.push(Message::assistant(&text_buf));
            used_tools.extend(pending_tool_calls.iter().map(|c| c.tool_name.clone()));

            let steered = self
                .run_tool_calls(job, entry, handle, topic.as_deref(), &pending_tool_calls, &mut messages)
                .await?;

            if let Some(steer_text) = steered {
                // The queued user text opens the next assistant turn.
                messages.push(Message::user(&steer_text));
                self.persist(
                    &job.agent_id,
                    &entry.session_id,
                    topic.as_deref(),
                    TurnKind::User { content: steer_text, sender: None },
                );
            }

            if loop_idx == MAX_TOOL_LOOPS - 1 {
                return Err(ProviderFailure::new(
                    ErrorKind::Internal,
                    format!("tool loop limit reached ({MAX_TOOL_LOOPS} iterations)"),
                ));
            }
        }

        Err(ProviderFailure::new(ErrorKind::Internal, "tool loop fell through"))
    }

    /// Execute a turn's tool calls in order.  When a steer message arrives,
    /// the remaining calls are skipped with a marker result; the steered
    /// text is returned for injection as the next user turn.
    async fn run_tool_calls(
        &self,
        job: &Job,
        entry: &SessionEntry,
        handle: &mut RunHandle,
        topic: Option<&str>,
        calls: &[ToolCall],
        messages: &mut Vec<Message>,
    ) -> Result<Option<String>, ProviderFailure> {
        let mut steer_text: Option<String> = None;

        for call in calls {
            if handle.cancel.is_cancelled() {
                return Ok(None);
            }

            // Tool-call boundary: steering preempts the remaining calls.
            if steer_text.is_none() {
                let mut collected = Vec::new();
                while let Ok(text) = handle.steer_rx.try_recv() {
                    collected.push(text);
                }
                if !collected.is_empty() {
                    steer_text = Some(collected.join("\n"));
                }
            }

            let (payload, is_error) = if steer_text.is_some() {
                (STEER_SKIP_RESULT.to_owned(), false)
            } else {
                self.hooks.fire_before_tool_call(job.run_id, call);
                let result = tokio::select! {
                    result = self.tools.execute(call) => result,
                    _ = handle.cancel.cancelled() => return Ok(None),
                };
                self.hooks
                    .fire_after_tool_call(job.run_id, call, &result.0, result.1);
                result
            };

            self.publish(RunEvent::Tool {
                run_id: job.run_id,
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                phase: ToolPhase::End,
                payload: Some(Value::String(truncate_str(&payload, 2000))),
            });

            messages.push(Message::tool_result(&call.call_id, &payload));

            // Persisted copy: hook transform, then size cap.  Image data is
            // kept in the live turn only; it never reaches the transcript.
            let persisted = self.hooks.fire_tool_result_persist(call, payload.clone());
            let persisted = truncate_str(&persisted, MAX_TOOL_PERSIST_CHARS);
            let size = persisted.len();
            self.persist(
                &job.agent_id,
                &entry.session_id,
                topic,
                TurnKind::ToolResult {
                    tool_name: call.tool_name.clone(),
                    args_hash: args_hash(&call.arguments),
                    payload: persisted,
                    size,
                    is_error,
                },
            );
        }

        Ok(steer_text)
    }

    fn load_history(&self, agent_id: &str, session_id: &str, topic: Option<&str>) -> Vec<Message> {
        let turns = match self.transcripts(agent_id).read(session_id, topic) {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "history load failed, starting empty");
                return Vec::new();
            }
        };

        // Replay from the last compaction note onward; other system notes
        // (abort markers, reset headers) are not boundaries.
        let boundary = turns
            .iter()
            .rposition(|t| match &t.kind {
                TurnKind::SystemNote { content, .. } => {
                    content.starts_with(COMPACTION_PREFIX)
                }
                _ => false,
            })
            .unwrap_or(0);

        turns[boundary..]
            .iter()
            .map(|turn| match &turn.kind {
                TurnKind::User { content, .. } => Message::user(content),
                TurnKind::Assistant { content, .. } => Message::assistant(content),
                TurnKind::ToolResult { payload, .. } => Message::tool_result("replay", payload),
                TurnKind::SystemNote { content, .. } => {
                    if content.starts_with(COMPACTION_PREFIX) {
                        Message::user(&format!("[conversation summary]\n{content}"))
                    } else {
                        Message::user(&format!("[note]\n{content}"))
                    }
                }
            })
            .collect()
    }

    fn persist_partial(&self, job: &Job, entry: &SessionEntry, topic: Option<&str>, partial: &str) {
        let content = if partial.is_empty() {
            "[run aborted]".to_owned()
        } else {
            format!("[run aborted] partial: {partial}")
        };
        self.persist(
            &job.agent_id,
            &entry.session_id,
            topic,
            TurnKind::SystemNote { content, parent_session: None },
        );
    }

    /// Compact when the replayed history grows past the window estimate:
    /// write a system-note summary turn that logically replaces the prefix.
    fn maybe_compact(&self, job: &Job, entry: &SessionEntry, topic: Option<&str>) {
        let turns = match self.transcripts(&job.agent_id).read(&entry.session_id, topic) {
            Ok(turns) => turns,
            Err(_) => return,
        };
        let window_chars = self.config.pruning.context_window_tokens * 4;
        let total: usize = turns.iter().map(|t| turn_chars(&t.kind)).sum();
        if total < window_chars.saturating_mul(8) / 10 {
            return;
        }

        self.hooks.fire_before_compaction(&entry.session_id);

        let summary = summarize_turns(&turns);
        self.persist(
            &job.agent_id,
            &entry.session_id,
            topic,
            TurnKind::SystemNote { content: summary.clone(), parent_session: None },
        );
        self.sessions.update(&job.agent_id, &job.session_key, |e| {
            e.compaction_count += 1;
        });
        self.publish(RunEvent::Compaction {
            run_id: job.run_id,
            session_id: entry.session_id.clone(),
            summary_chars: summary.len(),
        });

        self.hooks.fire_after_compaction(&entry.session_id, &summary);
    }
}

fn topic_of(job: &Job, topic_threads: bool) -> Option<String> {
    if !topic_threads {
        return None;
    }
    match job.envelope.peer.kind {
        sb_domain::envelope::PeerKind::Thread => Some(job.envelope.peer.id.clone()),
        _ => None,
    }
}

fn turn_chars(kind: &TurnKind) -> usize {
    match kind {
        TurnKind::User { content, .. } => content.len(),
        TurnKind::Assistant { content, .. } => content.len(),
        TurnKind::ToolResult { payload, .. } => payload.len(),
        TurnKind::SystemNote { content, .. } => content.len(),
    }
}

/// The final payload: user-visible text, plus the tool summary in verbose
/// mode and the reasoning when visibility is on.
fn compose_final_payload(
    text: String,
    used_tools: &[String],
    verbose: bool,
    reasoning: Option<&str>,
) -> String {
    let mut out = text;
    if verbose && !used_tools.is_empty() {
        let mut names = used_tools.to_vec();
        names.dedup();
        out.push_str(&format!("\n\n_tools used: {}_", names.join(", ")));
    }
    if let Some(reasoning) = reasoning {
        if !reasoning.trim().is_empty() {
            out.push_str(&format!("\n\n_reasoning:_\n{reasoning}"));
        }
    }
    out
}

/// Marks compaction notes; the history loader keys its replay boundary on
/// this prefix.
const COMPACTION_PREFIX: &str = "Earlier conversation, compacted:";

/// A cheap extractive summary: one clipped line per user/assistant turn.
fn summarize_turns(turns: &[sb_sessions::TranscriptTurn]) -> String {
    let mut lines = vec![COMPACTION_PREFIX.to_owned()];
    for turn in turns {
        let (who, content) = match &turn.kind {
            TurnKind::User { content, .. } => ("user", content),
            TurnKind::Assistant { content, .. } => ("assistant", content),
            _ => continue,
        };
        let first_line = content.lines().next().unwrap_or_default();
        if !first_line.is_empty() {
            lines.push(format!("- {who}: {}", truncate_str(first_line, 120)));
        }
    }
    lines.join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
