// src/utils/rate_limit.rs

//! Token pacing for outbound requests.
//!
//! One limiter instance is shared by all API fetch workers and a separate
//! instance by all webhook senders. The mutex only guards the slot
//! computation; the actual wait happens after the lock is released, so a
//! waiting caller never blocks other workers. tokio's `Mutex` queues
//! waiters in FIFO order, which keeps slot hand-out fair under
//! contention.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Paces callers to at most `rate_per_sec` acquisitions per second.
pub struct RateLimiter {
    interval: Option<Duration>,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter. A rate of `0` disables pacing entirely.
    pub fn new(rate_per_sec: f64) -> Self {
        let interval = (rate_per_sec > 0.0).then(|| Duration::from_secs_f64(1.0 / rate_per_sec));
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait for the next available slot.
    ///
    /// Returns `false` when the wait was interrupted by shutdown; callers
    /// must not proceed with the request in that case.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        let Some(interval) = self.interval else {
            return !cancel.is_cancelled();
        };

        let deadline = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            *next_slot = Some(slot + interval);
            slot
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Whether pacing is active.
    pub fn enabled(&self) -> bool {
        self.interval.is_some()
    }
}
