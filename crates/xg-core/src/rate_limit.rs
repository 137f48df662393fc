//! Token-paced rate limiter.
//!
//! Paces callers so that consecutive [`RateLimiter::acquire`] completions are
//! at least `interval` apart. The first acquisition after an idle period
//! passes immediately; there is no burst credit beyond that.
//!
//! Slots are reserved under a short lock and the wait happens outside of it,
//! so many tasks can queue on one limiter without serializing on the mutex.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, XgError};

/// Paces operations to at most one per `interval`.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    /// Earliest instant the next caller may proceed.
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter that lets one operation through per `interval`.
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Create a limiter that allows `rate` operations per second.
    pub fn per_second(rate: u32) -> Self {
        Self::new(Duration::from_secs(1) / rate.max(1))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserve the next slot and return the instant it opens.
    fn reserve(&self) -> Instant {
        let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.interval);
        slot
    }

    /// Wait for the next slot.
    pub async fn acquire(&self) {
        let slot = self.reserve();
        tokio::time::sleep_until(slot).await;
    }

    /// Wait for the next slot, or fail with [`XgError::Canceled`] if `cancel`
    /// fires first. A reserved slot is not returned on cancellation.
    pub async fn acquire_or_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(XgError::Canceled),
            _ = self.acquire() => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_acquire_is_immediate() {
        let limiter = RateLimiter::per_second(5);
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_consecutive_acquires() {
        let limiter = RateLimiter::per_second(5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // Slots at 0, 200, 400, 600, 800ms.
        assert_eq!(start.elapsed(), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_period_does_not_bank_tokens() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_wait() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        limiter.acquire().await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let res = limiter.acquire_or_cancel(&cancel).await;
        assert_eq!(res, Err(XgError::Canceled));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_get_distinct_slots() {
        let limiter = std::sync::Arc::new(RateLimiter::new(Duration::from_millis(50)));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut done = Vec::new();
        for h in handles {
            done.push(h.await.unwrap() - start);
        }
        done.sort();
        assert_eq!(
            done,
            vec![
                Duration::ZERO,
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(150),
            ]
        );
    }
}
