//! The lane-based job queue: per-session serialization with bounded global
//! concurrency, arrival modes (interrupt / steer / followup / collect /
//! steer-backlog), inbound dedup, debounce, and the post-run quiet window.

pub mod backlog;
pub mod cancel;
pub mod debounce;
pub mod dedupe;
pub mod lane;

pub use backlog::{Arrival, PendingJob, PushOutcome};
pub use cancel::{CancelReason, CancelToken};
pub use debounce::{merge_burst, DebounceDecision, Debouncer};
pub use dedupe::DedupeStore;
pub use lane::{Job, JobDispatcher, LaneScheduler, RunHandle, SubmitOptions, SubmitOutcome};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use uuid::Uuid;

    use sb_domain::config::{ArrivalMode, DropPolicy, QueueConfig};
    use sb_domain::envelope::{Envelope, Peer};
    use sb_domain::error::RunStatus;

    fn envelope(body: &str, sender: &str, message_id: &str) -> Envelope {
        Envelope {
            channel: "telegram".into(),
            account_id: "b1".into(),
            sender_id: format!("telegram:{sender}"),
            sender_name: Some(sender.into()),
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

    struct MockDispatcher {
        delay: Duration,
        mark_streaming: bool,
        finished: Mutex<Vec<(String, RunStatus)>>,
        steered: Mutex<Vec<String>>,
        expired: Mutex<Vec<Uuid>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl MockDispatcher {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                mark_streaming: true,
                finished: Mutex::new(Vec::new()),
                steered: Mutex::new(Vec::new()),
                expired: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }

        fn finished_bodies(&self) -> Vec<String> {
            self.finished.lock().iter().map(|(b, _)| b.clone()).collect()
        }

        fn statuses(&self) -> Vec<RunStatus> {
            self.finished.lock().iter().map(|(_, s)| *s).collect()
        }
    }

    #[async_trait]
    impl JobDispatcher for MockDispatcher {
        async fn dispatch(&self, job: Job, mut handle: RunHandle) -> RunStatus {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            if self.mark_streaming {
                handle.streaming.store(true, Ordering::Release);
            }

            let status = tokio::select! {
                _ = tokio::time::sleep(self.delay) => RunStatus::Ok,
                _ = handle.cancel.cancelled() => handle
                    .cancel
                    .reason()
                    .map(|r| r.status())
                    .unwrap_or(RunStatus::Cancelled),
            };

            while let Ok(steer) = handle.steer_rx.try_recv() {
                self.steered.lock().push(steer);
            }

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.lock().push((job.body.clone(), status));
            status
        }

        async fn expired(&self, job: Job) {
            self.expired.lock().push(job.run_id);
        }
    }

    fn scheduler(dispatcher: Arc<MockDispatcher>, lanes: &[(&str, usize)]) -> LaneScheduler {
        let config = QueueConfig {
            global_lanes: lanes
                .iter()
                .map(|(n, c)| ((*n).to_owned(), *c))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        };
        LaneScheduler::new(&config, dispatcher)
    }

    fn opts(mode: ArrivalMode, debounce_ms: u64, run_timeout: Duration) -> SubmitOptions {
        SubmitOptions {
            mode,
            debounce_ms,
            cap: 20,
            drop: DropPolicy::Old,
            lane: "main".into(),
            run_timeout,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    #[tokio::test]
    async fn collect_merges_into_one_run() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(120));
        let sched = scheduler(dispatcher.clone(), &[("main", 4)]);
        let o = opts(ArrivalMode::Collect, 30, Duration::from_secs(10));

        let first = sched.submit("bot1", "agent:bot1:main", envelope("start", "alice", "m0"), o.clone());
        assert!(matches!(first, SubmitOutcome::Accepted { .. }));
        wait_for(|| sched.is_running("agent:bot1:main"), "first run starts").await;

        // Burst of three while the run is active.
        let a = sched.submit("bot1", "agent:bot1:main", envelope("a", "alice", "m1"), o.clone());
        let b = sched.submit("bot1", "agent:bot1:main", envelope("b", "alice", "m2"), o.clone());
        let c = sched.submit("bot1", "agent:bot1:main", envelope("c", "alice", "m3"), o.clone());
        assert!(matches!(a, SubmitOutcome::Accepted { .. }));
        assert_eq!(b.run_id(), a.run_id());
        assert_eq!(c.run_id(), a.run_id());

        wait_for(|| dispatcher.finished.lock().len() == 2, "merged followup").await;
        let bodies = dispatcher.finished_bodies();
        assert_eq!(bodies[0], "start");
        assert_eq!(bodies[1], "alice: a\nalice: b\nalice: c");
    }

    #[tokio::test]
    async fn at_most_one_run_per_session_fifo() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(30));
        let sched = scheduler(dispatcher.clone(), &[("main", 8)]);
        let o = opts(ArrivalMode::Followup, 10, Duration::from_secs(10));

        for i in 0..5 {
            sched.submit(
                "bot1",
                "agent:bot1:main",
                envelope(&format!("m{i}"), "alice", &format!("id{i}")),
                o.clone(),
            );
        }

        wait_for(|| dispatcher.finished.lock().len() == 5, "all runs").await;
        assert_eq!(dispatcher.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.finished_bodies(), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn interrupt_cancels_active_run() {
        let dispatcher = MockDispatcher::new(Duration::from_secs(30));
        let sched = scheduler(dispatcher.clone(), &[("main", 4)]);
        let o = opts(ArrivalMode::Interrupt, 50, Duration::from_secs(60));

        sched.submit("bot1", "agent:bot1:main", envelope("long", "alice", "m0"), o.clone());
        wait_for(|| sched.is_running("agent:bot1:main"), "run starts").await;

        let outcome =
            sched.submit("bot1", "agent:bot1:main", envelope("urgent", "alice", "m1"), o.clone());
        assert!(matches!(outcome, SubmitOutcome::Interrupted { .. }));

        wait_for(|| dispatcher.finished.lock().len() == 2, "both runs finish").await;
        let statuses = dispatcher.statuses();
        assert_eq!(statuses[0], RunStatus::Cancelled);
        assert_eq!(statuses[1], RunStatus::Ok);
        assert_eq!(dispatcher.finished_bodies()[1], "urgent");
    }

    #[tokio::test]
    async fn deadline_fires_timeout() {
        let dispatcher = MockDispatcher::new(Duration::from_secs(30));
        let sched = scheduler(dispatcher.clone(), &[("main", 4)]);
        let o = opts(ArrivalMode::Collect, 10, Duration::from_millis(80));

        sched.submit("bot1", "agent:bot1:main", envelope("stall", "alice", "m0"), o);
        wait_for(|| !dispatcher.finished.lock().is_empty(), "timeout surfaces").await;
        assert_eq!(dispatcher.statuses(), vec![RunStatus::Timeout]);
    }

    #[tokio::test]
    async fn global_lane_gates_cross_session_concurrency() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(60));
        let sched = scheduler(dispatcher.clone(), &[("main", 1)]);
        let o = opts(ArrivalMode::Collect, 10, Duration::from_secs(10));

        sched.submit("bot1", "agent:bot1:dm:a", envelope("s1", "alice", "m0"), o.clone());
        sched.submit("bot1", "agent:bot1:dm:b", envelope("s2", "bob", "m1"), o.clone());

        wait_for(|| dispatcher.finished.lock().len() == 2, "both sessions").await;
        assert_eq!(dispatcher.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn independent_sessions_run_concurrently() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(80));
        let sched = scheduler(dispatcher.clone(), &[("main", 4)]);
        let o = opts(ArrivalMode::Collect, 10, Duration::from_secs(10));

        sched.submit("bot1", "agent:bot1:dm:a", envelope("s1", "alice", "m0"), o.clone());
        sched.submit("bot1", "agent:bot1:dm:b", envelope("s2", "bob", "m1"), o.clone());

        wait_for(|| dispatcher.finished.lock().len() == 2, "both sessions").await;
        assert!(dispatcher.max_running.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn steer_injects_into_active_run() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(150));
        let sched = scheduler(dispatcher.clone(), &[("main", 4)]);
        let o = opts(ArrivalMode::Steer, 10, Duration::from_secs(10));

        sched.submit("bot1", "agent:bot1:main", envelope("work", "alice", "m0"), o.clone());
        wait_for(|| sched.is_running("agent:bot1:main"), "run starts").await;
        // Give the dispatcher a beat to mark the stream live.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome =
            sched.submit("bot1", "agent:bot1:main", envelope("stop and do X", "alice", "m1"), o.clone());
        assert!(matches!(outcome, SubmitOutcome::Steered { .. }));

        wait_for(|| !dispatcher.finished.lock().is_empty(), "run ends").await;
        assert_eq!(dispatcher.steered.lock().clone(), vec!["alice: stop and do X"]);
        // Pure steer leaves nothing behind.
        assert_eq!(sched.queue_depth("agent:bot1:main"), 0);
    }

    #[tokio::test]
    async fn steer_backlog_does_both() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(150));
        let sched = scheduler(dispatcher.clone(), &[("main", 4)]);
        let o = opts(ArrivalMode::SteerBacklog, 20, Duration::from_secs(10));

        sched.submit("bot1", "agent:bot1:main", envelope("work", "alice", "m0"), o.clone());
        wait_for(|| sched.is_running("agent:bot1:main"), "run starts").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome =
            sched.submit("bot1", "agent:bot1:main", envelope("also this", "alice", "m1"), o.clone());
        assert!(matches!(outcome, SubmitOutcome::SteeredAndQueued { .. }));

        wait_for(|| dispatcher.finished.lock().len() == 2, "followup also runs").await;
        assert!(dispatcher.steered.lock().iter().any(|s| s.contains("also this")));
        assert!(dispatcher.finished_bodies()[1].contains("also this"));
    }

    #[tokio::test]
    async fn stop_cancels_and_flushes_backlog() {
        let dispatcher = MockDispatcher::new(Duration::from_secs(30));
        let sched = scheduler(dispatcher.clone(), &[("main", 4)]);
        let o = opts(ArrivalMode::Collect, 10, Duration::from_secs(60));

        sched.submit("bot1", "agent:bot1:main", envelope("long", "alice", "m0"), o.clone());
        wait_for(|| sched.is_running("agent:bot1:main"), "run starts").await;
        sched.submit("bot1", "agent:bot1:main", envelope("queued", "alice", "m1"), o.clone());
        assert_eq!(sched.queue_depth("agent:bot1:main"), 1);

        assert!(sched.stop("agent:bot1:main"));
        wait_for(|| !dispatcher.finished.lock().is_empty(), "cancel lands").await;
        assert_eq!(dispatcher.statuses(), vec![RunStatus::Cancelled]);
        assert_eq!(sched.queue_depth("agent:bot1:main"), 0);

        // Nothing else dispatches.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.finished.lock().len(), 1);
    }

    #[tokio::test]
    async fn expired_job_skips_dispatch() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(300));
        let sched = scheduler(dispatcher.clone(), &[("main", 1)]);

        // First session occupies the single global slot.
        sched.submit(
            "bot1",
            "agent:bot1:dm:a",
            envelope("long", "alice", "m0"),
            opts(ArrivalMode::Collect, 10, Duration::from_secs(10)),
        );
        wait_for(|| sched.is_running("agent:bot1:dm:a"), "first run starts").await;

        // Second session's job can't get the slot before its tight deadline.
        sched.submit(
            "bot1",
            "agent:bot1:dm:b",
            envelope("late", "bob", "m1"),
            opts(ArrivalMode::Collect, 10, Duration::from_millis(40)),
        );

        wait_for(|| !dispatcher.expired.lock().is_empty(), "expiry recorded").await;
        wait_for(|| !dispatcher.finished.lock().is_empty(), "first finishes").await;
        assert_eq!(dispatcher.finished_bodies(), vec!["long"]);
    }

    #[tokio::test]
    async fn empty_collect_body_produces_no_run() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(20));
        let sched = scheduler(dispatcher.clone(), &[("main", 4)]);
        let o = opts(ArrivalMode::Collect, 10, Duration::from_secs(10));

        sched.submit("bot1", "agent:bot1:main", envelope("   ", "alice", "m0"), o);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(dispatcher.finished.lock().is_empty());
        assert!(!sched.is_running("agent:bot1:main"));
    }

    #[tokio::test]
    async fn quiet_window_delays_followup() {
        let dispatcher = MockDispatcher::new(Duration::from_millis(30));
        let sched = scheduler(dispatcher.clone(), &[("main", 4)]);
        let o = opts(ArrivalMode::Collect, 200, Duration::from_secs(10));

        sched.submit("bot1", "agent:bot1:main", envelope("first", "alice", "m0"), o.clone());
        wait_for(|| sched.is_running("agent:bot1:main"), "run starts").await;
        sched.submit("bot1", "agent:bot1:main", envelope("second", "alice", "m1"), o.clone());

        wait_for(|| dispatcher.finished.lock().len() == 1, "first finishes").await;
        // Still inside the quiet window.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(dispatcher.finished.lock().len(), 1);

        wait_for(|| dispatcher.finished.lock().len() == 2, "quiet window passes").await;
    }
}
