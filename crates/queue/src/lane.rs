//! The lane scheduler.
//!
//! Every job travels through two lanes: its session lane (cap 1, modeled
//! as the lane state machine) and a named global lane (a semaphore with a
//! configured cap).  A job holds its session lane for the entire run; the
//! global-lane slot is acquired at dispatch and gates concurrency across
//! sessions without preempting running jobs.
//!
//! Arrival modes decide how a message interacts with an active run:
//! interrupt cancels it, steer injects into it at the next tool boundary,
//! followup/collect queue behind it, steer-backlog does both.  After a run
//! ends, a quiet window (`debounce_ms`) must pass before the merged
//! followup starts; arrivals during the window extend it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use sb_domain::config::{ArrivalMode, DropPolicy, QueueConfig};
use sb_domain::envelope::Envelope;
use sb_domain::error::RunStatus;

use crate::backlog::{Arrival, Backlog, PendingJob, PushOutcome};
use crate::cancel::{CancelReason, CancelToken};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job & dispatch contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A dispatched unit of work.  Exactly one run per job.
#[derive(Debug, Clone)]
pub struct Job {
    pub run_id: Uuid,
    pub session_key: String,
    pub agent_id: String,
    pub mode: ArrivalMode,
    /// Merged body (sender-tagged for multi-arrival jobs).
    pub body: String,
    /// Newest envelope, for reply context and delivery hints.
    pub envelope: Envelope,
    pub accepted_at: DateTime<Utc>,
    /// Absolute deadline: `accepted_at + run_timeout`.
    pub deadline: DateTime<Utc>,
    pub parent_run_id: Option<Uuid>,
}

/// Everything the runner needs to cooperate with the scheduler.
pub struct RunHandle {
    pub run_id: Uuid,
    pub session_key: String,
    pub cancel: CancelToken,
    /// Steer messages injected at the next tool-call boundary.
    pub steer_rx: mpsc::UnboundedReceiver<String>,
    /// The runner flips this once the model stream is live; steer falls
    /// back to followup until then.
    pub streaming: Arc<AtomicBool>,
}

/// The seam between the queue and the agent runtime.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Run one job to completion, honoring `handle.cancel`.  Returns the
    /// terminal status.
    async fn dispatch(&self, job: Job, handle: RunHandle) -> RunStatus;

    /// A job whose deadline elapsed before it could dispatch; the
    /// implementation emits its timeout lifecycle.
    async fn expired(&self, job: Job);
}

/// Per-submit options, resolved by the caller from channel/session config.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub mode: ArrivalMode,
    pub debounce_ms: u64,
    pub cap: usize,
    pub drop: DropPolicy,
    /// Named global lane gating dispatch.
    pub lane: String,
    pub run_timeout: Duration,
}

impl SubmitOptions {
    pub fn from_config(config: &QueueConfig, run_timeout: Duration) -> Self {
        Self {
            mode: config.default_mode,
            debounce_ms: config.debounce_ms,
            cap: config.cap,
            drop: config.drop,
            lane: "main".into(),
            run_timeout,
        }
    }
}

/// What happened to a submitted arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued (or started) as its own job.
    Accepted { run_id: Uuid },
    /// Merged into an existing collect job.
    Merged { run_id: Uuid },
    /// Injected into the active run at the next tool boundary.
    Steered { run_id: Uuid },
    /// Steered into the active run and also retained as a followup.
    SteeredAndQueued { steered: Uuid, queued: Uuid },
    /// The active run was cancelled; the arrival starts next.
    Interrupted { cancelled: Uuid, run_id: Uuid },
    /// Dropped by the overflow policy.
    Rejected,
}

impl SubmitOutcome {
    /// The run the caller should wait on, if any.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::Accepted { run_id }
            | Self::Merged { run_id }
            | Self::Steered { run_id }
            | Self::Interrupted { run_id, .. } => Some(*run_id),
            Self::SteeredAndQueued { queued, .. } => Some(*queued),
            Self::Rejected => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lane state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ActiveRun {
    run_id: Uuid,
    cancel: CancelToken,
    steer_tx: mpsc::UnboundedSender<String>,
    streaming: Arc<AtomicBool>,
}

enum LaneState {
    Idle,
    Running(ActiveRun),
}

struct SessionLane {
    state: LaneState,
    backlog: Backlog,
    opts: SubmitOptions,
    agent_id: String,
    /// No new job starts before this instant (post-run quiet window).
    quiet_until: Option<Instant>,
}

impl SessionLane {
    fn new(agent_id: String, opts: SubmitOptions) -> Self {
        Self {
            state: LaneState::Idle,
            backlog: Backlog::default(),
            opts,
            agent_id,
            quiet_until: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-session FIFO lanes gated by named global lanes.
#[derive(Clone)]
pub struct LaneScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    dispatcher: Arc<dyn JobDispatcher>,
    /// Named global lanes; missing names fall back to `main`.
    global: HashMap<String, Arc<Semaphore>>,
    lanes: Mutex<HashMap<String, SessionLane>>,
}

impl LaneScheduler {
    pub fn new(config: &QueueConfig, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        let mut global: HashMap<String, Arc<Semaphore>> = config
            .global_lanes
            .iter()
            .map(|(name, cap)| (name.clone(), Arc::new(Semaphore::new((*cap).max(1)))))
            .collect();
        global
            .entry("main".to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(1)));

        Self {
            inner: Arc::new(Inner {
                dispatcher,
                global,
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Submit one routed arrival.
    pub fn submit(
        &self,
        agent_id: &str,
        session_key: &str,
        envelope: Envelope,
        opts: SubmitOptions,
    ) -> SubmitOutcome {
        let key = session_key.to_ascii_lowercase();
        let arrival = Arrival { envelope, accepted_at: Utc::now() };

        let (outcome, dispatch_now) = {
            let mut lanes = self.inner.lanes.lock();
            let lane = lanes
                .entry(key.clone())
                .or_insert_with(|| SessionLane::new(agent_id.to_owned(), opts.clone()));
            lane.opts = opts;
            lane.agent_id = agent_id.to_owned();

            let active = match &lane.state {
                LaneState::Running(active) => Some(active_snapshot(active)),
                LaneState::Idle => None,
            };

            match active {
                Some(active) => {
                    let outcome = Self::submit_while_running(lane, active, arrival);
                    (outcome, false)
                }
                None => {
                    // Modes that need an active run degenerate to queueing.
                    let mode = match lane.opts.mode {
                        ArrivalMode::Interrupt
                        | ArrivalMode::Steer
                        | ArrivalMode::SteerBacklog => ArrivalMode::Followup,
                        other => other,
                    };
                    let push = lane.backlog.push(
                        mode,
                        arrival,
                        None,
                        lane.opts.cap,
                        lane.opts.drop,
                    );
                    // An arrival during the post-run quiet window extends it.
                    if let Some(quiet) = lane.quiet_until {
                        let extended =
                            Instant::now() + Duration::from_millis(lane.opts.debounce_ms);
                        lane.quiet_until = Some(quiet.max(extended));
                    }
                    let outcome = match push {
                        PushOutcome::Queued { run_id } => SubmitOutcome::Accepted { run_id },
                        PushOutcome::Merged { run_id } => SubmitOutcome::Merged { run_id },
                        PushOutcome::Rejected => SubmitOutcome::Rejected,
                    };
                    (outcome, !matches!(push, PushOutcome::Rejected))
                }
            }
        };

        if dispatch_now {
            self.spawn_dispatch(key);
        }
        outcome
    }

    fn submit_while_running(
        lane: &mut SessionLane,
        active: ActiveSnapshot,
        arrival: Arrival,
    ) -> SubmitOutcome {
        let opts = lane.opts.clone();
        match opts.mode {
            ArrivalMode::Interrupt => {
                active.cancel.cancel(CancelReason::Interrupt);
                let run_id = lane.backlog.push_front(arrival, Some(active.run_id));
                tracing::info!(
                    cancelled = %active.run_id,
                    next = %run_id,
                    "interrupt: cancelling active run"
                );
                SubmitOutcome::Interrupted { cancelled: active.run_id, run_id }
            }
            ArrivalMode::Steer | ArrivalMode::SteerBacklog => {
                let tagged = steer_text(&arrival);
                let delivered = active.streaming.load(Ordering::Acquire)
                    && active.steer_tx.send(tagged).is_ok();

                if opts.mode == ArrivalMode::Steer {
                    if delivered {
                        return SubmitOutcome::Steered { run_id: active.run_id };
                    }
                    // Not actively streaming: fall back to followup.
                    let push = lane.backlog.push(
                        ArrivalMode::Followup,
                        arrival,
                        Some(active.run_id),
                        opts.cap,
                        opts.drop,
                    );
                    return match push {
                        PushOutcome::Queued { run_id } => SubmitOutcome::Accepted { run_id },
                        PushOutcome::Merged { run_id } => SubmitOutcome::Merged { run_id },
                        PushOutcome::Rejected => SubmitOutcome::Rejected,
                    };
                }

                // steer-backlog: deliberately both.
                let push = lane.backlog.push(
                    ArrivalMode::Collect,
                    arrival,
                    Some(active.run_id),
                    opts.cap,
                    opts.drop,
                );
                match (delivered, push.run_id()) {
                    (true, Some(queued)) => SubmitOutcome::SteeredAndQueued {
                        steered: active.run_id,
                        queued,
                    },
                    (false, Some(run_id)) => SubmitOutcome::Accepted { run_id },
                    (true, None) => SubmitOutcome::Steered { run_id: active.run_id },
                    (false, None) => SubmitOutcome::Rejected,
                }
            }
            ArrivalMode::Followup | ArrivalMode::Collect => {
                let push = lane.backlog.push(
                    opts.mode,
                    arrival,
                    Some(active.run_id),
                    opts.cap,
                    opts.drop,
                );
                match push {
                    PushOutcome::Queued { run_id } => SubmitOutcome::Accepted { run_id },
                    PushOutcome::Merged { run_id } => SubmitOutcome::Merged { run_id },
                    PushOutcome::Rejected => SubmitOutcome::Rejected,
                }
            }
        }
    }

    /// Cancel the active run and flush the backlog (user stop).
    pub fn stop(&self, session_key: &str) -> bool {
        let key = session_key.to_ascii_lowercase();
        let mut lanes = self.inner.lanes.lock();
        let Some(lane) = lanes.get_mut(&key) else {
            return false;
        };
        let flushed = lane.backlog.clear();
        match &lane.state {
            LaneState::Running(active) => {
                active.cancel.cancel(CancelReason::Stop);
                tracing::info!(
                    session_key = %key,
                    run_id = %active.run_id,
                    flushed,
                    "stop: cancelling active run and flushing backlog"
                );
                true
            }
            LaneState::Idle => flushed > 0,
        }
    }

    /// Whether a run is currently active on the session.
    pub fn is_running(&self, session_key: &str) -> bool {
        let key = session_key.to_ascii_lowercase();
        self.inner
            .lanes
            .lock()
            .get(&key)
            .is_some_and(|l| matches!(l.state, LaneState::Running(_)))
    }

    /// Queued arrivals behind the active run.
    pub fn queue_depth(&self, session_key: &str) -> usize {
        let key = session_key.to_ascii_lowercase();
        self.inner
            .lanes
            .lock()
            .get(&key)
            .map(|l| l.backlog.arrival_count())
            .unwrap_or(0)
    }

    /// Sessions with an active run or backlog (for `status`).
    pub fn active_sessions(&self) -> Vec<String> {
        self.inner
            .lanes
            .lock()
            .iter()
            .filter(|(_, l)| {
                matches!(l.state, LaneState::Running(_)) || !l.backlog.is_empty()
            })
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn spawn_dispatch(&self, key: String) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            Inner::try_dispatch(inner, key).await;
        });
    }
}

struct ActiveSnapshot {
    run_id: Uuid,
    cancel: CancelToken,
    steer_tx: mpsc::UnboundedSender<String>,
    streaming: Arc<AtomicBool>,
}

fn active_snapshot(active: &ActiveRun) -> ActiveSnapshot {
    ActiveSnapshot {
        run_id: active.run_id,
        cancel: active.cancel.clone(),
        steer_tx: active.steer_tx.clone(),
        streaming: active.streaming.clone(),
    }
}

fn steer_text(arrival: &Arrival) -> String {
    format!("{}: {}", arrival.sender_tag(), arrival.envelope.body)
}

impl Inner {
    /// Try to move a lane from Idle to Running.  Respects the quiet window
    /// (except for interrupt jobs) and skips jobs with no content.
    fn try_dispatch(
        inner: Arc<Inner>,
        key: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        loop {
            let dispatch = {
                let mut lanes = inner.lanes.lock();
                let Some(lane) = lanes.get_mut(&key) else {
                    return;
                };
                if !matches!(lane.state, LaneState::Idle) {
                    return;
                }
                if lane.backlog.is_empty() {
                    return;
                }

                // Quiet window: interrupts bypass it.
                if lane.backlog.front_mode() != Some(ArrivalMode::Interrupt) {
                    if let Some(quiet) = lane.quiet_until {
                        let now = Instant::now();
                        if now < quiet {
                            let wait = quiet - now;
                            let inner2 = inner.clone();
                            let key2 = key.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(wait).await;
                                Inner::try_dispatch(inner2, key2).await;
                            });
                            return;
                        }
                        lane.quiet_until = None;
                    }
                }

                let Some(pending) = lane.backlog.pop() else {
                    return;
                };

                // Empty-body collect jobs produce no run.
                if !pending.has_content() {
                    tracing::debug!(
                        session_key = %key,
                        run_id = %pending.run_id,
                        "skipping job with no content"
                    );
                    continue;
                }

                let (steer_tx, steer_rx) = mpsc::unbounded_channel();
                let cancel = CancelToken::new();
                let streaming = Arc::new(AtomicBool::new(false));
                let opts = lane.opts.clone();

                let job = build_job(&key, &lane.agent_id, &opts, pending);
                let handle = RunHandle {
                    run_id: job.run_id,
                    session_key: key.clone(),
                    cancel: cancel.clone(),
                    steer_rx,
                    streaming: streaming.clone(),
                };

                lane.state = LaneState::Running(ActiveRun {
                    run_id: job.run_id,
                    cancel: cancel.clone(),
                    steer_tx,
                    streaming,
                });

                Some((job, handle, cancel, opts))
            };

            let Some((job, handle, cancel, opts)) = dispatch else {
                return;
            };

            Inner::run_job(inner.clone(), key.clone(), job, handle, cancel, opts).await;
            // Loop: the lane is idle again, more backlog may be ready.
        }
        })
    }

    async fn run_job(
        inner: Arc<Inner>,
        key: String,
        job: Job,
        handle: RunHandle,
        cancel: CancelToken,
        opts: SubmitOptions,
    ) {
        let sem = inner
            .global
            .get(&opts.lane)
            .or_else(|| inner.global.get("main"))
            .cloned()
            .expect("main lane always exists");

        let remaining = (job.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        if remaining.is_zero() {
            tracing::warn!(
                session_key = %key,
                run_id = %job.run_id,
                "deadline elapsed before dispatch"
            );
            inner.dispatcher.expired(job).await;
            inner.finish_lane(&key);
            return;
        }

        // The session lane is already held; wait for a global slot, but not
        // past the job's deadline.
        let permit = tokio::select! {
            permit = sem.acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    inner.finish_lane(&key);
                    return;
                }
            },
            _ = tokio::time::sleep(remaining) => {
                tracing::warn!(
                    session_key = %key,
                    run_id = %job.run_id,
                    "deadline elapsed before dispatch"
                );
                inner.dispatcher.expired(job).await;
                inner.finish_lane(&key);
                return;
            }
        };

        // Watchdog: fire the cancel signal when the deadline passes.  The
        // runner observes it and returns a timeout status.
        let remaining = (job.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let watchdog_cancel = cancel.clone();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            watchdog_cancel.cancel(CancelReason::Timeout);
        });

        let run_id = job.run_id;
        let status = inner.dispatcher.dispatch(job, handle).await;
        watchdog.abort();
        drop(permit);

        tracing::debug!(session_key = %key, %run_id, ?status, "run finished");
        inner.finish_lane(&key);
    }

    /// Release the session lane and open the post-run quiet window.
    fn finish_lane(&self, key: &str) {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get_mut(key) {
            lane.state = LaneState::Idle;
            if lane.backlog.front_mode() != Some(ArrivalMode::Interrupt) {
                lane.quiet_until =
                    Some(Instant::now() + Duration::from_millis(lane.opts.debounce_ms));
            }
        }
    }
}

fn build_job(key: &str, agent_id: &str, opts: &SubmitOptions, pending: PendingJob) -> Job {
    let body = pending.merged_body();
    let envelope = pending
        .latest_envelope()
        .cloned()
        .expect("pending job with no arrivals");
    Job {
        run_id: pending.run_id,
        session_key: key.to_owned(),
        agent_id: agent_id.to_owned(),
        mode: pending.mode,
        body,
        envelope,
        accepted_at: pending.accepted_at,
        deadline: pending.accepted_at
            + chrono::Duration::from_std(opts.run_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(600)),
        parent_run_id: pending.parent_run_id,
    }
}
