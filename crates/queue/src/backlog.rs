//! The per-session pending backlog.
//!
//! One structure holds everything queued behind a session's active run:
//! followup jobs, collect-merged bursts, and interrupt jobs at the head.
//! Overflow applies the configured drop policy; `summarize` keeps a bullet
//! list of dropped messages that prefixes the next merged job.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use sb_domain::config::{ArrivalMode, DropPolicy};
use sb_domain::envelope::Envelope;

/// One queued inbound message.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub envelope: Envelope,
    pub accepted_at: DateTime<Utc>,
}

impl Arrival {
    pub fn sender_tag(&self) -> &str {
        self.envelope
            .sender_name
            .as_deref()
            .unwrap_or(&self.envelope.sender_id)
    }
}

/// A queued unit that will produce exactly one run on dispatch.  The run ID
/// is allocated at acceptance so callers can wait on it immediately.
#[derive(Debug)]
pub struct PendingJob {
    pub run_id: Uuid,
    pub mode: ArrivalMode,
    /// `(channel, peer)` identity; collect never merges across these.
    pub conversation: String,
    pub arrivals: Vec<Arrival>,
    pub accepted_at: DateTime<Utc>,
    pub parent_run_id: Option<Uuid>,
    /// Summaries of messages dropped under the `summarize` policy, emitted
    /// as a synthetic preface when this job's body is merged.
    pub dropped_summaries: Vec<String>,
}

impl PendingJob {
    fn new(mode: ArrivalMode, arrival: Arrival, parent_run_id: Option<Uuid>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            conversation: conversation_of(&arrival.envelope),
            accepted_at: arrival.accepted_at,
            arrivals: vec![arrival],
            parent_run_id,
            dropped_summaries: Vec::new(),
        }
    }

    /// Merge the arrivals into one body.  Multi-arrival jobs tag each
    /// message with its sender; dropped-message summaries prefix the body.
    pub fn merged_body(&self) -> String {
        let mut body = String::new();

        if !self.dropped_summaries.is_empty() {
            body.push_str(&format!(
                "[{} earlier message(s) were dropped from the queue]\n",
                self.dropped_summaries.len()
            ));
            for summary in &self.dropped_summaries {
                body.push_str("- ");
                body.push_str(summary);
                body.push('\n');
            }
            body.push('\n');
        }

        if self.arrivals.len() == 1 && self.dropped_summaries.is_empty() {
            body.push_str(&self.arrivals[0].envelope.body);
            return body;
        }

        for arrival in &self.arrivals {
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(arrival.sender_tag());
            body.push_str(": ");
            body.push_str(&arrival.envelope.body);
        }
        body
    }

    /// The newest envelope supplies reply context.
    pub fn latest_envelope(&self) -> Option<&Envelope> {
        self.arrivals.last().map(|a| &a.envelope)
    }

    pub fn has_content(&self) -> bool {
        self.arrivals
            .iter()
            .any(|a| !a.envelope.body.trim().is_empty() || a.envelope.has_attachments())
    }
}

fn conversation_of(envelope: &Envelope) -> String {
    format!("{}:{}", envelope.channel, envelope.peer.id)
}

/// Outcome of queueing one arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A new pending job was created.
    Queued { run_id: Uuid },
    /// The arrival merged into an existing collect job.
    Merged { run_id: Uuid },
    /// Overflow with `drop = new`: the arrival was discarded.
    Rejected,
}

impl PushOutcome {
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::Queued { run_id } | Self::Merged { run_id } => Some(*run_id),
            Self::Rejected => None,
        }
    }
}

/// FIFO of pending jobs for one session lane.
#[derive(Debug, Default)]
pub struct Backlog {
    queue: VecDeque<PendingJob>,
    arrival_count: usize,
    /// Summaries of dropped messages, attached to the next popped job.
    summaries: Vec<String>,
}

impl Backlog {
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn arrival_count(&self) -> usize {
        self.arrival_count
    }

    pub fn job_count(&self) -> usize {
        self.queue.len()
    }

    pub fn front_mode(&self) -> Option<ArrivalMode> {
        self.queue.front().map(|j| j.mode)
    }

    /// Queue an arrival.  Collect-mode arrivals merge into the newest
    /// pending collect job for the same conversation; everything else
    /// appends a new job.  `cap`/`drop` bound the total arrival count.
    pub fn push(
        &mut self,
        mode: ArrivalMode,
        arrival: Arrival,
        parent_run_id: Option<Uuid>,
        cap: usize,
        drop: DropPolicy,
    ) -> PushOutcome {
        if self.arrival_count >= cap.max(1) {
            match drop {
                DropPolicy::New => {
                    tracing::warn!(
                        conversation = %conversation_of(&arrival.envelope),
                        "backlog overflow, dropping newest arrival"
                    );
                    return PushOutcome::Rejected;
                }
                DropPolicy::Old => {
                    self.drop_oldest(false);
                }
                DropPolicy::Summarize => {
                    self.drop_oldest(true);
                }
            }
        }

        if mode == ArrivalMode::Collect {
            let conversation = conversation_of(&arrival.envelope);
            if let Some(job) = self
                .queue
                .iter_mut()
                .rev()
                .find(|j| j.mode == ArrivalMode::Collect && j.conversation == conversation)
            {
                job.arrivals.push(arrival);
                self.arrival_count += 1;
                return PushOutcome::Merged { run_id: job.run_id };
            }
        }

        let job = PendingJob::new(mode, arrival, parent_run_id);
        let run_id = job.run_id;
        self.queue.push_back(job);
        self.arrival_count += 1;
        PushOutcome::Queued { run_id }
    }

    /// Queue an interrupt job at the head.
    pub fn push_front(&mut self, arrival: Arrival, parent_run_id: Option<Uuid>) -> Uuid {
        let job = PendingJob::new(ArrivalMode::Interrupt, arrival, parent_run_id);
        let run_id = job.run_id;
        self.queue.push_front(job);
        self.arrival_count += 1;
        run_id
    }

    fn drop_oldest(&mut self, summarize: bool) {
        let Some(front) = self.queue.front_mut() else {
            return;
        };
        let dropped = front.arrivals.remove(0);
        self.arrival_count -= 1;
        if summarize {
            let mut summary =
                format!("{}: {}", dropped.sender_tag(), dropped.envelope.body);
            if summary.chars().count() > 140 {
                summary = summary.chars().take(140).collect();
                summary.push('…');
            }
            self.summaries.push(summary);
        }
        // A job drained of its arrivals produces no run.
        if self.queue.front().is_some_and(|j| j.arrivals.is_empty()) {
            self.queue.pop_front();
        }
    }

    /// Pop the next job to dispatch.  Dropped-message summaries surface on
    /// the popped job as a synthetic preface.
    pub fn pop(&mut self) -> Option<PendingJob> {
        let mut job = self.queue.pop_front()?;
        self.arrival_count -= job.arrivals.len();
        if !self.summaries.is_empty() {
            job.dropped_summaries.append(&mut self.summaries);
        }
        Some(job)
    }

    /// Drop everything (user stop flushes the followup backlog).
    pub fn clear(&mut self) -> usize {
        let flushed = self.arrival_count;
        self.queue.clear();
        self.summaries.clear();
        self.arrival_count = 0;
        flushed
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use sb_domain::envelope::Peer;

    fn arrival(body: &str, sender: &str, peer: &str) -> Arrival {
        Arrival {
            envelope: Envelope {
                channel: "telegram".into(),
                account_id: "b1".into(),
                sender_id: format!("telegram:{sender}"),
                sender_name: Some(sender.into()),
                peer: Peer::direct(peer),
                parent_peer: None,
                guild_id: None,
                team_id: None,
                timestamp: Utc::now(),
                body: body.into(),
                message_id: format!("m-{body}"),
                reply_to_id: None,
                attachments: vec![],
                is_mention: false,
                is_bot_self_reply: false,
            },
            accepted_at: Utc::now(),
        }
    }

    fn push_collect(b: &mut Backlog, a: Arrival) -> PushOutcome {
        b.push(ArrivalMode::Collect, a, None, 20, DropPolicy::Old)
    }

    #[test]
    fn collect_merges_same_conversation() {
        let mut b = Backlog::default();
        let first = push_collect(&mut b, arrival("a", "alice", "p1"));
        let second = push_collect(&mut b, arrival("b", "alice", "p1"));
        assert_eq!(first.run_id(), second.run_id());
        assert_eq!(b.job_count(), 1);
        assert_eq!(b.arrival_count(), 2);

        let job = b.pop().unwrap();
        assert_eq!(job.merged_body(), "alice: a\nalice: b");
    }

    #[test]
    fn collect_keeps_conversations_separate() {
        let mut b = Backlog::default();
        push_collect(&mut b, arrival("a", "alice", "p1"));
        push_collect(&mut b, arrival("b", "bob", "p2"));
        assert_eq!(b.job_count(), 2);
    }

    #[test]
    fn followup_jobs_stay_separate() {
        let mut b = Backlog::default();
        let first = b.push(ArrivalMode::Followup, arrival("a", "alice", "p1"), None, 20, DropPolicy::Old);
        let second = b.push(ArrivalMode::Followup, arrival("b", "alice", "p1"), None, 20, DropPolicy::Old);
        assert_ne!(first.run_id(), second.run_id());
        assert_eq!(b.job_count(), 2);
    }

    #[test]
    fn single_arrival_body_is_untagged() {
        let mut b = Backlog::default();
        push_collect(&mut b, arrival("hello", "alice", "p1"));
        assert_eq!(b.pop().unwrap().merged_body(), "hello");
    }

    #[test]
    fn overflow_drop_old() {
        let mut b = Backlog::default();
        for i in 0..4 {
            b.push(
                ArrivalMode::Followup,
                arrival(&format!("m{i}"), "alice", "p1"),
                None,
                3,
                DropPolicy::Old,
            );
        }
        assert_eq!(b.arrival_count(), 3);
        // m0 was dropped; the first surviving job is m1.
        assert_eq!(b.pop().unwrap().merged_body(), "m1");
    }

    #[test]
    fn overflow_drop_new_rejects() {
        let mut b = Backlog::default();
        for i in 0..3 {
            b.push(
                ArrivalMode::Followup,
                arrival(&format!("m{i}"), "alice", "p1"),
                None,
                3,
                DropPolicy::New,
            );
        }
        let outcome = b.push(
            ArrivalMode::Followup,
            arrival("m3", "alice", "p1"),
            None,
            3,
            DropPolicy::New,
        );
        assert_eq!(outcome, PushOutcome::Rejected);
        assert_eq!(b.arrival_count(), 3);
    }

    #[test]
    fn overflow_summarize_prefaces_next_job() {
        let mut b = Backlog::default();
        for i in 0..3 {
            push_collect(&mut b, arrival(&format!("m{i}"), "alice", "p1"));
        }
        b.push(
            ArrivalMode::Collect,
            arrival("m3", "alice", "p1"),
            None,
            3,
            DropPolicy::Summarize,
        );
        let job = b.pop().unwrap();
        let body = job.merged_body();
        assert!(body.starts_with("[1 earlier message(s) were dropped"));
        assert!(body.contains("- alice: m0"));
        assert!(body.contains("alice: m3"));
        assert!(!body.contains("alice: m0\nalice"));
    }

    #[test]
    fn interrupt_goes_to_head() {
        let mut b = Backlog::default();
        b.push(ArrivalMode::Followup, arrival("later", "alice", "p1"), None, 20, DropPolicy::Old);
        b.push_front(arrival("now", "alice", "p1"), None);
        assert_eq!(b.front_mode(), Some(ArrivalMode::Interrupt));
        assert_eq!(b.pop().unwrap().merged_body(), "now");
    }

    #[test]
    fn empty_body_has_no_content() {
        let mut b = Backlog::default();
        push_collect(&mut b, arrival("   ", "alice", "p1"));
        let job = b.pop().unwrap();
        assert!(!job.has_content());
    }

    #[test]
    fn clear_flushes_all() {
        let mut b = Backlog::default();
        push_collect(&mut b, arrival("a", "alice", "p1"));
        push_collect(&mut b, arrival("b", "alice", "p1"));
        assert_eq!(b.clear(), 2);
        assert!(b.is_empty());
    }
}
