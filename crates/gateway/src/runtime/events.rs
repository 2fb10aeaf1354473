//! Typed publish/subscribe for run events.
//!
//! Fan-out is per-run: subscribers attach to a run ID and receive an
//! ordered stream until the run's terminal lifecycle event, at which point
//! the channel is torn down.  A separate waiter primitive resolves when the
//! terminal event is observed; waiters enforce their own timeout,
//! independent of the run's deadline, and never stop the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use sb_domain::error::RunStatus;
use sb_protocol::{RunEvent, WaitResult};

use super::runs::RunStore;

const CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    runs: Arc<RunStore>,
    channels: RwLock<HashMap<Uuid, broadcast::Sender<RunEvent>>>,
}

impl EventBus {
    pub fn new(runs: Arc<RunStore>) -> Self {
        Self { runs, channels: RwLock::new(HashMap::new()) }
    }

    pub fn run_store(&self) -> &Arc<RunStore> {
        &self.runs
    }

    /// Subscribe to a run's events.  Safe to call before the run starts.
    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<RunEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish one event.  Terminal lifecycle events record onto the run
    /// store and tear the channel down afterwards.
    pub fn publish(&self, event: RunEvent) {
        let run_id = event.run_id();
        let terminal = event.is_terminal();

        if let RunEvent::Lifecycle { status: Some(status), error, .. } = &event {
            let error = error.clone();
            let terminal_status = *status;
            self.runs.update(&run_id, |run| {
                if terminal {
                    run.error = error;
                    run.finish(terminal_status);
                } else {
                    run.status = terminal_status;
                    if run.started_at.is_none() {
                        run.started_at = Some(chrono::Utc::now());
                    }
                }
            });
            if terminal {
                if let Some(run) = self.runs.get(&run_id) {
                    self.runs.persist(&run);
                }
            }
        }

        {
            let channels = self.channels.read();
            if let Some(tx) = channels.get(&run_id) {
                let _ = tx.send(event);
            }
        }

        if terminal {
            self.channels.write().remove(&run_id);
        }
    }

    /// Resolve when the run reaches a terminal state, or time out.  The
    /// timeout is waiter-only: the run keeps going.
    pub async fn wait(&self, run_id: Uuid, timeout: Duration) -> Option<WaitResult> {
        // Subscribe before checking the store so a terminal event between
        // the check and the recv loop is not missed.
        let mut rx = self.subscribe(run_id);

        if let Some(result) = self.terminal_result(&run_id) {
            return Some(result);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = tokio::time::sleep_until(deadline) => return None,
            };
            match event {
                Ok(event) if event.is_terminal() => {
                    return self.terminal_result(&run_id).or_else(|| {
                        // Record already evicted: synthesize from the event.
                        match event {
                            RunEvent::Lifecycle { status, error, .. } => Some(WaitResult {
                                status: status.unwrap_or(RunStatus::Error),
                                started_at: chrono::Utc::now(),
                                ended_at: Some(chrono::Utc::now()),
                                error,
                            }),
                            _ => None,
                        }
                    });
                }
                Ok(_) => continue,
                // Lagged subscribers re-check the store; a closed channel
                // means the terminal event was already published.
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(result) = self.terminal_result(&run_id) {
                        return Some(result);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return self.terminal_result(&run_id);
                }
            }
        }
    }

    fn terminal_result(&self, run_id: &Uuid) -> Option<WaitResult> {
        let run = self.runs.get(run_id)?;
        if !run.status.is_terminal() {
            return None;
        }
        Some(WaitResult {
            status: run.status,
            started_at: run.started_at.unwrap_or(run.accepted_at),
            ended_at: run.ended_at,
            error: run.error.clone(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
