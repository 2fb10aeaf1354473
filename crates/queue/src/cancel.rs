//! Interrupt-capable cancellation tokens.
//!
//! Each active run holds a `CancelToken`.  The lane scheduler cancels it on
//! deadline expiry, on a user stop, or when an interrupt-mode arrival
//! replaces the run.  The runner checks the token at delta boundaries and
//! maps the reason to the terminal status.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use sb_domain::error::RunStatus;

/// Why a run was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit user stop.
    Stop,
    /// The job's deadline fired.
    Timeout,
    /// An interrupt-mode arrival replaced the run.
    Interrupt,
}

impl CancelReason {
    /// The terminal status a run cancelled for this reason records.
    pub fn status(self) -> RunStatus {
        match self {
            Self::Stop | Self::Interrupt => RunStatus::Cancelled,
            Self::Timeout => RunStatus::Timeout,
        }
    }
}

const LIVE: u8 = 0;
const STOP: u8 = 1;
const TIMEOUT: u8 = 2;
const INTERRUPT: u8 = 3;

/// A cancellation token checked by the run loop.  Clones share state.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(LIVE)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signal cancellation.  The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        let value = match reason {
            CancelReason::Stop => STOP,
            CancelReason::Timeout => TIMEOUT,
            CancelReason::Interrupt => INTERRUPT,
        };
        if self
            .state
            .compare_exchange(LIVE, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) != LIVE
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.state.load(Ordering::Acquire) {
            STOP => Some(CancelReason::Stop),
            TIMEOUT => Some(CancelReason::Timeout),
            INTERRUPT => Some(CancelReason::Interrupt),
            _ => None,
        }
    }

    /// Suspend until cancelled.  Used in `select!` arms around model and
    /// tool awaits.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel(CancelReason::Timeout);
        token.cancel(CancelReason::Stop);
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel(CancelReason::Stop);
        assert!(clone.is_cancelled());
        assert_eq!(clone.reason(), Some(CancelReason::Stop));
    }

    #[test]
    fn reason_maps_to_status() {
        assert_eq!(CancelReason::Stop.status(), RunStatus::Cancelled);
        assert_eq!(CancelReason::Interrupt.status(), RunStatus::Cancelled);
        assert_eq!(CancelReason::Timeout.status(), RunStatus::Timeout);
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel(CancelReason::Stop);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel(CancelReason::Stop);
        token.cancelled().await;
    }
}
