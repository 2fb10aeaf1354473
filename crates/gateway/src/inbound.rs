//! The inbound pipeline: dedupe → debounce → route → policy → session
//! lifecycle → queue submit, with delivery wired per accepted run.
//!
//! This is the single entry point for all transports; the control plane's
//! `agent` method reuses it with debounce bypassed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use sb_domain::config::{Config, SendPolicyMode};
use sb_domain::envelope::Envelope;
use sb_queue::{
    merge_burst, DebounceDecision, Debouncer, DedupeStore, LaneScheduler, SubmitOptions,
    SubmitOutcome,
};
use sb_routing::{chat_type, RouteDecision, Router};
use sb_sessions::{LifecycleManager, ResetReason, SessionStore};

use crate::outbound::OutboundShaper;
use crate::runtime::{EventBus, HookRegistry, RunRecord};

/// What the pipeline did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDecision {
    /// A job was queued (or merged/steered); callers may wait on the run.
    Submitted {
        session_key: String,
        run_id: uuid::Uuid,
    },
    /// Buffered by the debouncer; a burst flush will submit later.
    Debounced,
    /// Dropped as a duplicate delivery.
    Deduped,
    /// Dropped by send policy.
    PolicyDenied(String),
    /// An authorized command was executed in place of a run.
    CommandHandled(String),
    /// A state-changing command from an unauthorized sender.
    CommandDenied,
    /// Queue overflow with `drop = new`, or an empty body.
    Dropped,
}

pub struct InboundPipeline {
    config: Arc<Config>,
    router: Router,
    dedupe: DedupeStore,
    debouncer: Debouncer,
    sessions: Arc<SessionStore>,
    lifecycle: LifecycleManager,
    scheduler: LaneScheduler,
    events: Arc<EventBus>,
    shaper: Arc<OutboundShaper>,
    hooks: HookRegistry,
}

impl InboundPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionStore>,
        scheduler: LaneScheduler,
        events: Arc<EventBus>,
        shaper: Arc<OutboundShaper>,
        hooks: HookRegistry,
    ) -> Self {
        let router = Router::from_config(&config);
        let dedupe = DedupeStore::new(
            Duration::from_secs(config.queue.dedup_ttl_secs),
            config.queue.dedup_cap,
        );
        let overrides = config
            .channels
            .iter()
            .filter_map(|(name, c)| {
                c.debounce_ms.map(|ms| (name.clone(), Duration::from_millis(ms)))
            })
            .collect();
        let debouncer = Debouncer::new(
            Duration::from_millis(2000),
            overrides,
            config.commands.sigil.clone(),
        );
        let lifecycle = LifecycleManager::new(config.sessions.lifecycle.clone());

        Self {
            config,
            router,
            dedupe,
            debouncer,
            sessions,
            lifecycle,
            scheduler,
            events,
            shaper,
            hooks,
        }
    }

    pub fn scheduler(&self) -> &LaneScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Transport entry point: dedupe, debounce, then process.
    pub fn handle_envelope(&self, envelope: Envelope) -> InboundDecision {
        if self.dedupe.check_and_insert(&envelope.dedup_key()) {
            tracing::debug!(key = %envelope.dedup_key(), "duplicate delivery dropped");
            return InboundDecision::Deduped;
        }

        match self.debouncer.push(envelope, Instant::now()) {
            DebounceDecision::Buffered => InboundDecision::Debounced,
            DebounceDecision::Flush(burst) => match merge_burst(burst) {
                Some(merged) => self.process(merged),
                None => InboundDecision::Dropped,
            },
        }
    }

    /// Drive pending debounce windows.  Call from a timer task.
    pub fn flush_due_bursts(&self) {
        for burst in self.debouncer.poll(Instant::now()) {
            if let Some(merged) = merge_burst(burst) {
                self.process(merged);
            }
        }
    }

    /// Control-plane entry point: no dedup replay protection beyond the
    /// idempotency cache, no debounce.
    pub fn process(&self, envelope: Envelope) -> InboundDecision {
        self.hooks.fire_message_received(&envelope);

        let decision = self.router.route(&envelope);

        if let Some(denied) = self.check_send_policy(&envelope) {
            return denied;
        }

        if decision.is_command {
            return self.handle_command(&envelope, &decision);
        }

        self.evaluate_reset(&envelope, &decision);

        self.submit(&envelope, &decision)
    }

    fn check_send_policy(&self, envelope: &Envelope) -> Option<InboundDecision> {
        let policy = &self.config.sessions.send_policy;
        let mode = policy
            .channel_overrides
            .get(&envelope.channel)
            .copied()
            .unwrap_or(policy.default);
        if mode == SendPolicyMode::Deny {
            return Some(InboundDecision::PolicyDenied(format!(
                "channel {} denied",
                envelope.channel
            )));
        }
        if policy.deny_groups && !envelope.peer.is_direct() {
            return Some(InboundDecision::PolicyDenied("groups denied".into()));
        }
        None
    }

    fn handle_command(&self, envelope: &Envelope, decision: &RouteDecision) -> InboundDecision {
        let sigil = &self.config.commands.sigil;
        let body = envelope.body.trim_start();
        let command = body
            .strip_prefix(sigil.as_str())
            .unwrap_or(body)
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match command.as_str() {
            "stop" => {
                if !decision.command_authorized {
                    return InboundDecision::CommandDenied;
                }
                self.scheduler.stop(&decision.session_key);
                InboundDecision::CommandHandled("stop".into())
            }
            "new" | "reset" => {
                if !decision.command_authorized {
                    return InboundDecision::CommandDenied;
                }
                self.sessions.reset_session(
                    &decision.agent_id,
                    &decision.session_key,
                    &ResetReason::Explicit.to_string(),
                );
                InboundDecision::CommandHandled(command)
            }
            // Unknown commands flow to the agent as ordinary text.
            _ => {
                self.evaluate_reset(envelope, decision);
                self.submit(envelope, decision)
            }
        }
    }

    fn evaluate_reset(&self, envelope: &Envelope, decision: &RouteDecision) {
        let Some(entry) = self.sessions.get(&decision.agent_id, &decision.session_key) else {
            return;
        };
        if let Some(reason) = self.lifecycle.should_reset(
            &entry,
            &envelope.channel,
            chat_type(envelope),
            Utc::now(),
        ) {
            tracing::info!(
                session_key = %decision.session_key,
                %reason,
                "resetting session on inbound"
            );
            self.sessions
                .reset_session(&decision.agent_id, &decision.session_key, &reason.to_string());
        }
    }

    fn submit(&self, envelope: &Envelope, decision: &RouteDecision) -> InboundDecision {
        // Session minting happens at dispatch (the runner writes the header
        // turn); inbound only keeps an existing entry's idle window fresh.
        self.sessions.touch(&decision.agent_id, &decision.session_key);

        let opts = self.submit_options(envelope, &decision.agent_id);
        let outcome = self.scheduler.submit(
            &decision.agent_id,
            &decision.session_key,
            envelope.clone(),
            opts,
        );

        match outcome {
            SubmitOutcome::Accepted { run_id } | SubmitOutcome::Interrupted { run_id, .. } => {
                // New job: record it and wire delivery.  The runner fills in
                // the session ID once the entry is resolved.
                self.events.run_store().insert(RunRecord::new(
                    run_id,
                    decision.session_key.clone(),
                    String::new(),
                    decision.agent_id.clone(),
                    Utc::now(),
                    &envelope.body,
                ));
                self.spawn_delivery(run_id, envelope, &decision.agent_id);
                InboundDecision::Submitted { session_key: decision.session_key.clone(), run_id }
            }
            SubmitOutcome::Merged { run_id }
            | SubmitOutcome::Steered { run_id }
            | SubmitOutcome::SteeredAndQueued { queued: run_id, .. } => {
                InboundDecision::Submitted { session_key: decision.session_key.clone(), run_id }
            }
            SubmitOutcome::Rejected => InboundDecision::Dropped,
        }
    }

    fn submit_options(&self, envelope: &Envelope, agent_id: &str) -> SubmitOptions {
        let agent = self.config.agents.get(agent_id).cloned().unwrap_or_default();
        let channel = self.config.channels.get(&envelope.channel);

        let mut opts = SubmitOptions::from_config(
            &self.config.queue,
            Duration::from_secs(agent.run_timeout_secs),
        );
        opts.lane = agent.lane;
        if let Some(channel) = channel {
            if let Some(mode) = channel.mode {
                opts.mode = mode;
            }
            if let Some(debounce) = channel.debounce_ms {
                opts.debounce_ms = debounce;
            }
        }
        opts
    }

    /// Agent-to-agent messaging: synthesize a job on another session.  The
    /// message travels the same queue as any inbound; the reply is read
    /// from the run record after its terminal event.
    pub fn send_to_session(&self, session_key: &str, message: &str) -> Option<uuid::Uuid> {
        // Keys are `agent:<agentId>:…`.
        let agent_id = session_key.split(':').nth(1)?.to_owned();
        let envelope = Envelope {
            channel: "control".into(),
            account_id: "gateway".into(),
            sender_id: "control:gateway".into(),
            sender_name: Some("gateway".into()),
            peer: sb_domain::envelope::Peer::direct("control:gateway"),
            parent_peer: None,
            guild_id: None,
            team_id: None,
            timestamp: Utc::now(),
            body: message.to_owned(),
            message_id: uuid::Uuid::new_v4().to_string(),
            reply_to_id: None,
            attachments: vec![],
            is_mention: false,
            is_bot_self_reply: false,
        };

        let opts = self.submit_options(&envelope, &agent_id);
        let outcome =
            self.scheduler
                .submit(&agent_id, session_key, envelope.clone(), opts);
        let run_id = outcome.run_id()?;

        if matches!(outcome, SubmitOutcome::Accepted { .. }) {
            self.events.run_store().insert(RunRecord::new(
                run_id,
                session_key.to_ascii_lowercase(),
                String::new(),
                agent_id,
                Utc::now(),
                message,
            ));
        }
        Some(run_id)
    }

    fn spawn_delivery(&self, run_id: uuid::Uuid, envelope: &Envelope, agent_id: &str) {
        let agent = self.config.agents.get(agent_id).cloned().unwrap_or_default();
        // Budget covers queue wait + the run itself.
        let budget = Duration::from_secs(agent.run_timeout_secs.saturating_mul(2).max(60));
        let shaper = self.shaper.clone();
        let events = self.events.clone();
        let envelope = envelope.clone();
        tokio::spawn(async move {
            shaper.deliver_run(events, run_id, &envelope, budget).await;
        });
    }
}
