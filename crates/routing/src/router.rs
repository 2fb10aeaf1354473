//! Deterministic envelope → agent routing.
//!
//! Binding rules are evaluated most-specific-first, stopping at the first
//! match: exact peer, then guild, then team, then `(channel, account)`,
//! then channel, then the default agent.  Ties within a specificity class
//! resolve by declaration order.  Routing is purely functional over the
//! envelope and the static binding set; a missing match is never fatal.

use sb_domain::config::{Binding, CommandsConfig, Config, DmScope};
use sb_domain::envelope::{Envelope, PeerKind};
use sb_sessions::{compute_session_key, IdentityResolver};

/// The result of routing one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub agent_id: String,
    pub session_key: String,
    /// Canonical peer ID after identity-link resolution.
    pub canonical_peer: String,
    /// Whether a command in this envelope may change state.
    pub command_authorized: bool,
    /// Whether the body starts with the command sigil.
    pub is_command: bool,
}

/// Specificity classes, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Specificity {
    Peer,
    Guild,
    Team,
    ChannelAccount,
    Channel,
}

fn classify(binding: &Binding) -> Option<Specificity> {
    if binding.peer_id.is_some() {
        Some(Specificity::Peer)
    } else if binding.guild_id.is_some() {
        Some(Specificity::Guild)
    } else if binding.team_id.is_some() {
        Some(Specificity::Team)
    } else if binding.channel.is_some() && binding.account_id.is_some() {
        Some(Specificity::ChannelAccount)
    } else if binding.channel.is_some() {
        Some(Specificity::Channel)
    } else {
        // Selector-less bindings never match; the default agent covers the
        // catch-all case.
        None
    }
}

/// Every selector that is present on the binding must match the envelope.
fn matches(binding: &Binding, envelope: &Envelope) -> bool {
    if let Some(peer) = &binding.peer_id {
        if !peer.eq_ignore_ascii_case(&envelope.peer.id) {
            return false;
        }
    }
    if let Some(guild) = &binding.guild_id {
        if envelope.guild_id.as_deref() != Some(guild.as_str()) {
            return false;
        }
    }
    if let Some(team) = &binding.team_id {
        if envelope.team_id.as_deref() != Some(team.as_str()) {
            return false;
        }
    }
    if let Some(channel) = &binding.channel {
        if !channel.eq_ignore_ascii_case(&envelope.channel) {
            return false;
        }
    }
    if let Some(account) = &binding.account_id {
        if account != &envelope.account_id {
            return false;
        }
    }
    true
}

/// Maps inbound envelopes to `(agentId, sessionKey)` via binding rules.
pub struct Router {
    bindings: Vec<Binding>,
    default_agent: String,
    commands: CommandsConfig,
    identity: IdentityResolver,
    /// (agent_id → dm_scope) resolved from config.
    dm_scopes: std::collections::HashMap<String, DmScope>,
    /// Channels whose threads use the `:topic:` suffix.
    topic_channels: std::collections::HashSet<String>,
}

impl Router {
    pub fn from_config(config: &Config) -> Self {
        let dm_scopes = config
            .agents
            .iter()
            .map(|(id, a)| (id.clone(), a.dm_scope))
            .collect();
        let topic_channels = config
            .channels
            .iter()
            .filter(|(_, c)| c.topic_threads)
            .map(|(name, _)| name.clone())
            .collect();
        Self {
            bindings: config.bindings.clone(),
            default_agent: config.default_agent.clone(),
            commands: config.commands.clone(),
            identity: IdentityResolver::from_config(&config.sessions.identity_links),
            dm_scopes,
            topic_channels,
        }
    }

    /// Route one envelope.  Never fails: unmatched envelopes fall back to
    /// the default agent.
    pub fn route(&self, envelope: &Envelope) -> RouteDecision {
        let agent_id = self.select_agent(envelope);

        let canonical_peer = self.identity.resolve(&envelope.sender_id);
        let dm_scope = self
            .dm_scopes
            .get(&agent_id)
            .copied()
            .unwrap_or_default();
        let topic_style = self.topic_channels.contains(&envelope.channel);

        let session_key =
            compute_session_key(&agent_id, dm_scope, envelope, &canonical_peer, topic_style);

        let is_command = !self.commands.sigil.is_empty()
            && envelope.body.trim_start().starts_with(&self.commands.sigil);
        let command_authorized = is_command && self.is_authorized(&canonical_peer, envelope);

        RouteDecision {
            agent_id,
            session_key,
            canonical_peer,
            command_authorized,
            is_command,
        }
    }

    fn select_agent(&self, envelope: &Envelope) -> String {
        let mut best: Option<(Specificity, usize, &Binding)> = None;
        for (order, binding) in self.bindings.iter().enumerate() {
            let Some(class) = classify(binding) else {
                continue;
            };
            if !matches(binding, envelope) {
                continue;
            }
            let candidate = (class, order, binding);
            best = match best {
                Some(prev) if (prev.0, prev.1) <= (candidate.0, candidate.1) => Some(prev),
                _ => Some(candidate),
            };
        }

        match best {
            Some((_, _, binding)) => binding.agent_id.clone(),
            None => {
                tracing::debug!(
                    channel = %envelope.channel,
                    peer = %envelope.peer.id,
                    "no matching binding, using default agent"
                );
                self.default_agent.clone()
            }
        }
    }

    fn is_authorized(&self, canonical_peer: &str, envelope: &Envelope) -> bool {
        let ids = [canonical_peer, envelope.sender_id.as_str()];

        if self
            .commands
            .allow_from
            .iter()
            .any(|allowed| ids.iter().any(|id| allowed.eq_ignore_ascii_case(id)))
        {
            return true;
        }

        self.commands.authorized_groups.iter().any(|group| {
            self.commands
                .access_groups
                .get(group)
                .is_some_and(|members| {
                    members
                        .iter()
                        .any(|m| ids.iter().any(|id| m.eq_ignore_ascii_case(id)))
                })
        })
    }
}

// Threads route on their parent container; expose the chat type used by
// reset policy here so callers classify consistently.
pub fn chat_type(envelope: &Envelope) -> &'static str {
    match envelope.peer.kind {
        PeerKind::Direct => "dm",
        PeerKind::Thread => "thread",
        PeerKind::Group | PeerKind::Room => "group",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sb_domain::config::{AgentConfig, IdentityLink};
    use sb_domain::envelope::Peer;

    fn envelope(channel: &str, peer: Peer) -> Envelope {
        Envelope {
            channel: channel.into(),
            account_id: "acct1".into(),
            sender_id: "telegram:42".into(),
            sender_name: None,
            peer,
            parent_peer: None,
            guild_id: None,
            team_id: None,
            timestamp: Utc::now(),
            body: "hello".into(),
            message_id: "m1".into(),
            reply_to_id: None,
            attachments: vec![],
            is_mention: false,
            is_bot_self_reply: false,
        }
    }

    fn binding(agent: &str) -> Binding {
        Binding { agent_id: agent.into(), ..Default::default() }
    }

    fn config_with(bindings: Vec<Binding>) -> Config {
        let mut config = Config { bindings, ..Default::default() };
        config.agents.insert("support".into(), AgentConfig::default());
        config.agents.insert("ops".into(), AgentConfig::default());
        config
    }

    #[test]
    fn unmatched_falls_back_to_default() {
        let router = Router::from_config(&config_with(vec![]));
        let decision = router.route(&envelope("telegram", Peer::direct("telegram:42")));
        assert_eq!(decision.agent_id, "main");
    }

    #[test]
    fn peer_binding_beats_channel_binding() {
        let peer_binding = Binding {
            peer_id: Some("telegram:42".into()),
            ..binding("support")
        };
        let channel_binding = Binding {
            channel: Some("telegram".into()),
            ..binding("ops")
        };
        // Declaration order deliberately reversed: specificity must win.
        let router = Router::from_config(&config_with(vec![channel_binding, peer_binding]));
        let decision = router.route(&envelope("telegram", Peer::direct("telegram:42")));
        assert_eq!(decision.agent_id, "support");
    }

    #[test]
    fn guild_binding_beats_channel_account() {
        let guild_binding = Binding {
            guild_id: Some("g1".into()),
            ..binding("support")
        };
        let ca_binding = Binding {
            channel: Some("discord".into()),
            account_id: Some("acct1".into()),
            ..binding("ops")
        };
        let router = Router::from_config(&config_with(vec![ca_binding, guild_binding]));
        let mut env = envelope("discord", Peer::group("room7"));
        env.guild_id = Some("g1".into());
        assert_eq!(router.route(&env).agent_id, "support");
    }

    #[test]
    fn ties_resolve_by_declaration_order() {
        let first = Binding { channel: Some("telegram".into()), ..binding("support") };
        let second = Binding { channel: Some("telegram".into()), ..binding("ops") };
        let router = Router::from_config(&config_with(vec![first, second]));
        let decision = router.route(&envelope("telegram", Peer::direct("x")));
        assert_eq!(decision.agent_id, "support");
    }

    #[test]
    fn binding_extra_selectors_must_match() {
        // A peer binding that also names a channel must match both.
        let b = Binding {
            peer_id: Some("telegram:42".into()),
            channel: Some("discord".into()),
            ..binding("support")
        };
        let router = Router::from_config(&config_with(vec![b]));
        let decision = router.route(&envelope("telegram", Peer::direct("telegram:42")));
        assert_eq!(decision.agent_id, "main");
    }

    #[test]
    fn identity_link_feeds_session_key() {
        let mut config = config_with(vec![]);
        config.sessions.identity_links.push(IdentityLink {
            canonical: "alice".into(),
            peer_ids: vec!["telegram:42".into()],
        });
        config
            .agents
            .insert("main".into(), AgentConfig { dm_scope: DmScope::PerPeer, ..Default::default() });
        let router = Router::from_config(&config);
        let decision = router.route(&envelope("telegram", Peer::direct("telegram:42")));
        assert_eq!(decision.canonical_peer, "alice");
        assert_eq!(decision.session_key, "agent:main:dm:alice");
    }

    #[test]
    fn command_detection_and_authorization() {
        let mut config = config_with(vec![]);
        config.commands.allow_from.push("telegram:42".into());
        let router = Router::from_config(&config);

        let mut env = envelope("telegram", Peer::direct("telegram:42"));
        env.body = "/reset".into();
        let decision = router.route(&env);
        assert!(decision.is_command);
        assert!(decision.command_authorized);
    }

    #[test]
    fn command_from_unknown_sender_is_unauthorized() {
        let router = Router::from_config(&config_with(vec![]));
        let mut env = envelope("telegram", Peer::direct("telegram:42"));
        env.body = "/reset".into();
        let decision = router.route(&env);
        assert!(decision.is_command);
        assert!(!decision.command_authorized);
    }

    #[test]
    fn access_group_authorizes() {
        let mut config = config_with(vec![]);
        config
            .commands
            .access_groups
            .insert("admins".into(), vec!["alice".into()]);
        config.commands.authorized_groups.push("admins".into());
        config.sessions.identity_links.push(IdentityLink {
            canonical: "alice".into(),
            peer_ids: vec!["telegram:42".into()],
        });
        let router = Router::from_config(&config);

        let mut env = envelope("telegram", Peer::direct("telegram:42"));
        env.body = "/new".into();
        assert!(router.route(&env).command_authorized);
    }

    #[test]
    fn chat_type_classification() {
        assert_eq!(chat_type(&envelope("t", Peer::direct("x"))), "dm");
        assert_eq!(chat_type(&envelope("t", Peer::group("x"))), "group");
        assert_eq!(chat_type(&envelope("t", Peer::room("x"))), "group");
        assert_eq!(chat_type(&envelope("t", Peer::thread("x"))), "thread");
    }
}
