//! Process-wide cooldown barrier.
//!
//! The exchange penalizes an IP address as a whole, so one gate is shared by
//! every [`RestClient`](crate::RestClient) built with
//! [`RestClient::new`](crate::RestClient::new). The gate holds a single
//! deadline in a `watch` channel: [`BackoffGate::arm`] pushes it forward and
//! wakes every waiter, [`BackoffGate::wait`] sleeps until the newest
//! deadline has passed. A gate can be re-armed any number of times, including
//! while tasks are already waiting on it.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use xg_core::{Result, XgError};

/// Longest cooldown a single arm can impose.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Repeatable cooldown barrier shared between REST clients.
#[derive(Debug)]
pub struct BackoffGate {
    deadline: watch::Sender<Option<Instant>>,
}

impl BackoffGate {
    pub fn new() -> Self {
        let (deadline, _) = watch::channel(None);
        Self { deadline }
    }

    /// The gate shared by all clients in this process.
    pub fn global() -> Arc<BackoffGate> {
        static GLOBAL: OnceLock<Arc<BackoffGate>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(BackoffGate::new())))
    }

    /// Start or extend a cooldown lasting `duration` from now.
    ///
    /// `duration` is capped at [`MAX_COOLDOWN`]. A deadline earlier than the
    /// one already armed is ignored. Returns the effective deadline.
    pub fn arm(&self, duration: Duration) -> Instant {
        let duration = duration.min(MAX_COOLDOWN);
        let until = Instant::now() + duration;
        let extended = self.deadline.send_if_modified(|current| match current {
            Some(existing) if *existing >= until => false,
            _ => {
                *current = Some(until);
                true
            }
        });

        if extended {
            warn!(cooldown = ?duration, "[rest] backoff armed");
        } else {
            debug!(cooldown = ?duration, "[rest] backoff already armed past requested deadline");
        }

        (*self.deadline.borrow()).unwrap_or(until)
    }

    /// Time left in the current cooldown, zero when disarmed.
    pub fn remaining(&self) -> Duration {
        match *self.deadline.borrow() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    pub fn is_armed(&self) -> bool {
        !self.remaining().is_zero()
    }

    /// Block until no cooldown is active, or fail with
    /// [`XgError::Canceled`] when `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.deadline.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            let deadline = match deadline {
                Some(d) if d > Instant::now() => d,
                _ => return Ok(()),
            };

            debug!(remaining = ?deadline.saturating_duration_since(Instant::now()), "[rest] waiting for backoff");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(XgError::Canceled),
                _ = tokio::time::sleep_until(deadline) => {}
                // Re-armed while we slept; re-read the deadline.
                _ = rx.changed() => {}
            }
        }
    }
}

impl Default for BackoffGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn disarmed_gate_passes_immediately() {
        let gate = BackoffGate::new();
        let start = Instant::now();
        gate.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!gate.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn armed_gate_blocks_until_deadline() {
        let gate = BackoffGate::new();
        gate.arm(Duration::from_secs(2));
        let start = Instant::now();
        gate.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(gate.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_while_waiting_extends_the_wait() {
        let gate = Arc::new(BackoffGate::new());
        gate.arm(Duration::from_secs(1));

        let g = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            g.arm(Duration::from_secs(3));
        });

        let start = Instant::now();
        gate.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_arm_does_not_shorten_episode() {
        let gate = BackoffGate::new();
        let long = gate.arm(Duration::from_secs(10));
        let effective = gate.arm(Duration::from_secs(1));
        assert_eq!(long, effective);
        assert_eq!(gate.remaining(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_can_be_armed_for_a_later_episode() {
        let gate = BackoffGate::new();
        gate.arm(Duration::from_secs(1));
        gate.wait(&CancellationToken::new()).await.unwrap();
        assert!(!gate.is_armed());

        gate.arm(Duration::from_secs(2));
        let start = Instant::now();
        gate.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn many_waiters_wake_together() {
        let gate = Arc::new(BackoffGate::new());
        gate.arm(Duration::from_secs(2));
        let start = Instant::now();

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move {
                    gate.wait(&CancellationToken::new()).await.unwrap();
                    Instant::now()
                })
            })
            .collect();

        // Concurrent arms from other in-flight requests.
        for secs in [1, 3, 2] {
            gate.arm(Duration::from_secs(secs));
        }

        for w in waiters {
            assert_eq!(w.await.unwrap() - start, Duration::from_secs(3));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_arm_is_capped() {
        let gate = BackoffGate::new();
        let start = Instant::now();
        assert_eq!(gate.arm(Duration::MAX), start + MAX_COOLDOWN);
        assert_eq!(gate.remaining(), MAX_COOLDOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_wait() {
        let gate = BackoffGate::new();
        gate.arm(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(gate.wait(&cancel).await, Err(XgError::Canceled));
    }
}
