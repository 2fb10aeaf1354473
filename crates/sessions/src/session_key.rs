//! Session key computation.
//!
//! Key templates:
//! - `agent:<agentId>:main`                               (DM scope = main)
//! - `agent:<agentId>:dm:<peerId>`                        (DM scope = per-peer)
//! - `agent:<agentId>:<channel>:dm:<peerId>`              (DM scope = per-channel-peer)
//! - `agent:<agentId>:<channel>:<accountId>:dm:<peerId>`  (DM scope = per-account-channel-peer)
//! - `agent:<agentId>:<channel>:group:<groupId>`
//! - `agent:<agentId>:<channel>:room:<roomId>`
//! - `...:thread:<threadId>` / `...:topic:<threadId>`
//!
//! Keys are the sole unit of serialization and are compared
//! case-insensitively; everything here emits lowercase.

use sb_domain::config::DmScope;
use sb_domain::envelope::{Envelope, PeerKind};

/// Compute a stable session key from the agent ID, DM scope, and an inbound
/// envelope.  `canonical_peer` is the sender's peer ID after identity-link
/// resolution.  `topic_style` selects the `:topic:` thread suffix used by
/// topic-based surfaces.
pub fn compute_session_key(
    agent_id: &str,
    dm_scope: DmScope,
    envelope: &Envelope,
    canonical_peer: &str,
    topic_style: bool,
) -> String {
    let base = format!("agent:{agent_id}");

    let key = match envelope.peer.kind {
        PeerKind::Direct => dm_key(&base, dm_scope, envelope, canonical_peer),
        PeerKind::Group => {
            format!("{base}:{}:group:{}", envelope.channel, envelope.peer.id)
        }
        PeerKind::Room => {
            format!("{base}:{}:room:{}", envelope.channel, envelope.peer.id)
        }
        PeerKind::Thread => {
            // Thread peers key off the containing group/room, then append
            // the thread suffix below.
            let parent = envelope
                .parent_peer
                .as_ref()
                .map(|p| match p.kind {
                    PeerKind::Room => format!("room:{}", p.id),
                    _ => format!("group:{}", p.id),
                })
                .unwrap_or_else(|| "group:unknown".to_owned());
            format!("{base}:{}:{parent}", envelope.channel)
        }
    };

    let key = maybe_append_thread(key, envelope, topic_style);
    key.to_ascii_lowercase()
}

fn dm_key(base: &str, dm_scope: DmScope, envelope: &Envelope, peer: &str) -> String {
    match dm_scope {
        DmScope::Main => format!("{base}:main"),
        DmScope::PerPeer => format!("{base}:dm:{peer}"),
        DmScope::PerChannelPeer => {
            format!("{base}:{}:dm:{peer}", envelope.channel)
        }
        DmScope::PerAccountChannelPeer => {
            format!("{base}:{}:{}:dm:{peer}", envelope.channel, envelope.account_id)
        }
    }
}

fn maybe_append_thread(key: String, envelope: &Envelope, topic_style: bool) -> String {
    let tid = match envelope.peer.kind {
        PeerKind::Thread => Some(envelope.peer.id.as_str()),
        _ => None,
    };
    match tid {
        Some(tid) if topic_style => format!("{key}:topic:{tid}"),
        Some(tid) => format!("{key}:thread:{tid}"),
        None => key,
    }
}

/// Normalize a key for map lookups.  Keys compare case-insensitively.
pub fn normalize_key(key: &str) -> String {
    key.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sb_domain::envelope::Peer;

    fn envelope(peer: Peer, parent: Option<Peer>) -> Envelope {
        Envelope {
            channel: "telegram".into(),
            account_id: "acct1".into(),
            sender_id: "telegram:42".into(),
            sender_name: None,
            peer,
            parent_peer: parent,
            guild_id: None,
            team_id: None,
            timestamp: Utc::now(),
            body: "hi".into(),
            message_id: "m1".into(),
            reply_to_id: None,
            attachments: vec![],
            is_mention: false,
            is_bot_self_reply: false,
        }
    }

    #[test]
    fn dm_main_scope() {
        let env = envelope(Peer::direct("telegram:42"), None);
        let key = compute_session_key("bot1", DmScope::Main, &env, "telegram:42", false);
        assert_eq!(key, "agent:bot1:main");
    }

    #[test]
    fn dm_per_peer_uses_canonical_identity() {
        let env = envelope(Peer::direct("telegram:42"), None);
        let key = compute_session_key("bot1", DmScope::PerPeer, &env, "alice", false);
        assert_eq!(key, "agent:bot1:dm:alice");
    }

    #[test]
    fn dm_per_channel_peer() {
        let env = envelope(Peer::direct("telegram:42"), None);
        let key =
            compute_session_key("bot1", DmScope::PerChannelPeer, &env, "telegram:42", false);
        assert_eq!(key, "agent:bot1:telegram:dm:telegram:42");
    }

    #[test]
    fn dm_per_account_channel_peer() {
        let env = envelope(Peer::direct("telegram:42"), None);
        let key = compute_session_key(
            "bot1",
            DmScope::PerAccountChannelPeer,
            &env,
            "telegram:42",
            false,
        );
        assert_eq!(key, "agent:bot1:telegram:acct1:dm:telegram:42");
    }

    #[test]
    fn group_message() {
        let env = envelope(Peer::group("G9"), None);
        let key = compute_session_key("bot1", DmScope::Main, &env, "telegram:42", false);
        assert_eq!(key, "agent:bot1:telegram:group:g9");
    }

    #[test]
    fn room_message() {
        let env = envelope(Peer::room("general"), None);
        let key = compute_session_key("bot1", DmScope::Main, &env, "telegram:42", false);
        assert_eq!(key, "agent:bot1:telegram:room:general");
    }

    #[test]
    fn thread_appends_suffix() {
        let env = envelope(Peer::thread("t77"), Some(Peer::group("G9")));
        let key = compute_session_key("bot1", DmScope::Main, &env, "telegram:42", false);
        assert_eq!(key, "agent:bot1:telegram:group:g9:thread:t77");
    }

    #[test]
    fn topic_surface_uses_topic_suffix() {
        let env = envelope(Peer::thread("t77"), Some(Peer::group("G9")));
        let key = compute_session_key("bot1", DmScope::Main, &env, "telegram:42", true);
        assert_eq!(key, "agent:bot1:telegram:group:g9:topic:t77");
    }

    #[test]
    fn keys_are_lowercase() {
        let env = envelope(Peer::direct("Telegram:ALICE"), None);
        let key = compute_session_key("Bot1", DmScope::PerPeer, &env, "Telegram:ALICE", false);
        assert_eq!(key, normalize_key(&key));
    }
}
