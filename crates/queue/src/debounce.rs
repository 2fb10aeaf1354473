//! Inbound debounce — coalesce text bursts from the same sender.
//!
//! Each `(channel, peer)` conversation has a timer; text-only arrivals
//! buffer until the window closes, then flush as one merged envelope.
//! Messages with attachments and command messages flush immediately and
//! bypass the window.  Time is injected so the policy is testable without
//! timers; the inbound pipeline drives `poll` from a tokio interval.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use sb_domain::envelope::Envelope;

/// What to do with an arrival.
#[derive(Debug)]
pub enum DebounceDecision {
    /// Deliver these envelopes now (merged burst or bypass).
    Flush(Vec<Envelope>),
    /// Buffered; the burst flushes when the window closes.
    Buffered,
}

struct PendingBurst {
    envelopes: Vec<Envelope>,
    deadline: Instant,
}

pub struct Debouncer {
    window: Duration,
    /// Per-channel window overrides.
    overrides: HashMap<String, Duration>,
    /// Command sigil; sigil-prefixed bodies bypass the window.
    sigil: String,
    pending: Mutex<HashMap<String, PendingBurst>>,
}

impl Debouncer {
    pub fn new(window: Duration, overrides: HashMap<String, Duration>, sigil: String) -> Self {
        Self {
            window,
            overrides,
            sigil,
            pending: Mutex::new(HashMap::new()),
        }
    }

    // Bursts coalesce per sender per conversation.
    fn key(envelope: &Envelope) -> String {
        format!("{}:{}:{}", envelope.channel, envelope.peer.id, envelope.sender_id)
    }

    fn window_for(&self, channel: &str) -> Duration {
        self.overrides.get(channel).copied().unwrap_or(self.window)
    }

    fn bypasses(&self, envelope: &Envelope) -> bool {
        envelope.has_attachments()
            || (!self.sigil.is_empty() && envelope.body.trim_start().starts_with(&self.sigil))
    }

    /// Accept one arrival.
    pub fn push(&self, envelope: Envelope, now: Instant) -> DebounceDecision {
        let window = self.window_for(&envelope.channel);

        if self.bypasses(&envelope) || window.is_zero() {
            // Bypass flushes any buffered burst first so order is kept.
            let mut pending = self.pending.lock();
            let mut out = pending
                .remove(&Self::key(&envelope))
                .map(|b| b.envelopes)
                .unwrap_or_default();
            out.push(envelope);
            return DebounceDecision::Flush(out);
        }

        let key = Self::key(&envelope);
        let mut pending = self.pending.lock();
        let burst = pending.entry(key).or_insert_with(|| PendingBurst {
            envelopes: Vec::new(),
            deadline: now + window,
        });
        burst.envelopes.push(envelope);
        // Each arrival extends the window.
        burst.deadline = now + window;
        DebounceDecision::Buffered
    }

    /// Collect bursts whose window has closed.
    pub fn poll(&self, now: Instant) -> Vec<Vec<Envelope>> {
        let mut pending = self.pending.lock();
        let ready: Vec<String> = pending
            .iter()
            .filter(|(_, b)| now >= b.deadline)
            .map(|(k, _)| k.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|k| pending.remove(&k))
            .map(|b| b.envelopes)
            .collect()
    }

    /// Earliest pending deadline, for the driving timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.lock().values().map(|b| b.deadline).min()
    }
}

/// Merge a flushed burst into one envelope: bodies concatenate in arrival
/// order, each tagged with its sender; the newest message supplies the
/// reply context and identifiers.  Single-message bursts pass through
/// untagged.
pub fn merge_burst(mut burst: Vec<Envelope>) -> Option<Envelope> {
    let last = burst.pop()?;
    if burst.is_empty() {
        return Some(last);
    }

    let mut body = String::new();
    for env in burst.iter().chain(std::iter::once(&last)) {
        if !body.is_empty() {
            body.push('\n');
        }
        let sender = env.sender_name.as_deref().unwrap_or(&env.sender_id);
        body.push_str(&format!("{sender}: {}", env.body));
    }

    let mut merged = last;
    merged.body = body;
    Some(merged)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sb_domain::envelope::{Attachment, Peer};

    fn envelope(body: &str, message_id: &str) -> Envelope {
        Envelope {
            channel: "telegram".into(),
            account_id: "b1".into(),
            sender_id: "telegram:42".into(),
            sender_name: Some("alice".into()),
            peer: Peer::direct("telegram:42"),
            parent_peer: None,
            guild_id: None,
            team_id: None,
            timestamp: Utc::now(),
            body: body.into(),
            message_id: message_id.into(),
            reply_to_id: None,
            attachments: vec![],
            is_mention: false,
            is_bot_self_reply: false,
        }
    }

    fn debouncer(window_ms: u64) -> Debouncer {
        Debouncer::new(Duration::from_millis(window_ms), HashMap::new(), "/".into())
    }

    #[test]
    fn burst_buffers_then_flushes() {
        let d = debouncer(2000);
        let start = Instant::now();

        assert!(matches!(d.push(envelope("a", "m1"), start), DebounceDecision::Buffered));
        assert!(matches!(
            d.push(envelope("b", "m2"), start + Duration::from_millis(500)),
            DebounceDecision::Buffered
        ));

        // Window extended by the second arrival: not ready at start + 2s.
        assert!(d.poll(start + Duration::from_millis(2000)).is_empty());

        let flushed = d.poll(start + Duration::from_millis(2600));
        assert_eq!(flushed.len(), 1);
        let merged = merge_burst(flushed.into_iter().next().unwrap()).unwrap();
        assert_eq!(merged.body, "alice: a\nalice: b");
        assert_eq!(merged.message_id, "m2");
    }

    #[test]
    fn command_bypasses_window() {
        let d = debouncer(2000);
        let now = Instant::now();
        match d.push(envelope("/reset", "m1"), now) {
            DebounceDecision::Flush(envs) => assert_eq!(envs.len(), 1),
            other => panic!("expected flush, got {other:?}"),
        }
    }

    #[test]
    fn attachment_flushes_buffered_burst_in_order() {
        let d = debouncer(2000);
        let now = Instant::now();
        d.push(envelope("text first", "m1"), now);

        let mut media = envelope("pic", "m2");
        media.attachments.push(Attachment {
            kind: "image".into(),
            url: None,
            name: None,
            size_bytes: None,
        });
        match d.push(media, now) {
            DebounceDecision::Flush(envs) => {
                assert_eq!(envs.len(), 2);
                assert_eq!(envs[0].message_id, "m1");
                assert_eq!(envs[1].message_id, "m2");
            }
            other => panic!("expected flush, got {other:?}"),
        }
    }

    #[test]
    fn per_channel_override() {
        let overrides = HashMap::from([("telegram".to_owned(), Duration::ZERO)]);
        let d = Debouncer::new(Duration::from_secs(2), overrides, "/".into());
        match d.push(envelope("hi", "m1"), Instant::now()) {
            DebounceDecision::Flush(envs) => assert_eq!(envs.len(), 1),
            other => panic!("expected flush, got {other:?}"),
        }
    }

    #[test]
    fn separate_conversations_do_not_merge() {
        let d = debouncer(1000);
        let now = Instant::now();
        d.push(envelope("a", "m1"), now);
        let mut other = envelope("b", "m2");
        other.peer = Peer::direct("telegram:99");
        d.push(other, now);

        let flushed = d.poll(now + Duration::from_secs(2));
        assert_eq!(flushed.len(), 2);
    }

    #[test]
    fn merge_burst_single_is_identity() {
        let merged = merge_burst(vec![envelope("solo", "m1")]).unwrap();
        assert_eq!(merged.body, "solo");
    }
}
