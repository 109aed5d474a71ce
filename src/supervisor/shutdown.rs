//! Cancellation driven by OS signals
//!
//! Signals only move a small state machine forward; the orchestrator looks
//! at it at well-defined points:
//!
//! - `Running`: the first signal asks for a graceful stop (the reactor
//!   finishes its iteration and the normal shutdown sequence runs).
//! - `Stopping`: shutdown is already under way, either because of an
//!   earlier signal or because the run ended. Another signal forces
//!   immediate teardown.
//! - `Forced`: children are killed and the process exits.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::common::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running = 0,
    Stopping = 1,
    Forced = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Forced,
        }
    }
}

/// Two-step cancellation token shared with the signal listener
#[derive(Debug)]
pub struct ShutdownToken {
    state: AtomicU8,
    changed: Notify,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running as u8),
            changed: Notify::new(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// A signal arrived: move one step towards forced termination
    pub fn escalate(&self) -> ShutdownState {
        let previous = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                Some((state + 1).min(ShutdownState::Forced as u8))
            })
            .unwrap_or(ShutdownState::Forced as u8);
        self.changed.notify_waiters();
        ShutdownState::from_u8((previous + 1).min(ShutdownState::Forced as u8))
    }

    /// The run is ending on its own; later signals must not wait for it
    pub fn begin_shutdown(&self) {
        let _ = self.state.compare_exchange(
            ShutdownState::Running as u8,
            ShutdownState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.changed.notify_waiters();
    }

    /// Resolves once a stop has been requested
    pub async fn stopping(&self) {
        self.reached(ShutdownState::Stopping).await
    }

    /// Resolves once immediate termination has been requested
    pub async fn forced(&self) {
        self.reached(ShutdownState::Forced).await
    }

    async fn reached(&self, target: ShutdownState) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state() >= target {
                return;
            }
            notified.await;
        }
    }
}

/// Listen for SIGINT, SIGTERM and SIGHUP for the rest of the process
#[cfg(unix)]
pub fn listen_for_signals(token: Arc<ShutdownToken>) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
                _ = sighup.recv() => "SIGHUP",
            };

            match token.escalate() {
                ShutdownState::Forced => {
                    tracing::warn!(signal = name, "received signal {} while shutting down, terminating immediately", name)
                }
                _ => tracing::warn!(signal = name, "received signal {}, stopping test execution", name),
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn listen_for_signals(token: Arc<ShutdownToken>) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            token.escalate();
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_escalation_steps() {
        let token = ShutdownToken::new();
        assert_eq!(token.state(), ShutdownState::Running);
        assert_eq!(token.escalate(), ShutdownState::Stopping);
        assert_eq!(token.escalate(), ShutdownState::Forced);
        assert_eq!(token.escalate(), ShutdownState::Forced);
    }

    #[test]
    fn test_signal_after_normal_end_forces() {
        let token = ShutdownToken::new();
        token.begin_shutdown();
        assert_eq!(token.state(), ShutdownState::Stopping);
        assert_eq!(token.escalate(), ShutdownState::Forced);
    }

    #[test]
    fn test_begin_shutdown_does_not_downgrade() {
        let token = ShutdownToken::new();
        token.escalate();
        token.escalate();
        token.begin_shutdown();
        assert_eq!(token.state(), ShutdownState::Forced);
    }

    #[tokio::test]
    async fn test_waiters_wake_up() {
        let token = Arc::new(ShutdownToken::new());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.forced().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        token.escalate();
        tokio::time::timeout(Duration::from_secs(1), token.stopping())
            .await
            .unwrap();
        token.escalate();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
