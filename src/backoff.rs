//! Reconnect backoff
//!
//! Exponential backoff with jitter, scheduled on the worker queue under a
//! named timer. The controller starts at zero delay so the first attempt
//! after a reset runs immediately; every attempt then grows the base delay
//! by the configured multiplier, clamped to `[initial_delay, max_delay]`.
//! Time already spent since the previous attempt counts towards the delay.

use crate::config::BackoffConfig;
use crate::queue::{AsyncQueue, DelayedOperation, TimerId};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Schedules reconnect attempts with growing delays
#[derive(Debug)]
pub struct BackoffController {
    queue: Arc<AsyncQueue>,
    timer_id: TimerId,
    config: BackoffConfig,
    current_base: Duration,
    attempts: u32,
    inhibited: bool,
    last_attempt: Option<Instant>,
    pending: Option<DelayedOperation>,
}

impl BackoffController {
    /// Create a controller whose first attempt runs without delay
    pub fn new(queue: Arc<AsyncQueue>, timer_id: TimerId, config: BackoffConfig) -> Self {
        Self {
            queue,
            timer_id,
            config,
            current_base: Duration::ZERO,
            attempts: 0,
            inhibited: false,
            last_attempt: None,
            pending: None,
        }
    }

    /// Run `operation` on the worker queue after the current backoff delay
    ///
    /// Any previously scheduled attempt is cancelled. A zero delay enqueues
    /// the operation directly, so no timer becomes observable.
    pub fn backoff_and_run(&mut self, operation: impl FnOnce() + Send + 'static) {
        self.cancel();

        let now = Instant::now();
        let delay = if std::mem::take(&mut self.inhibited) {
            Duration::ZERO
        } else {
            let elapsed = self
                .last_attempt
                .map(|last| now.saturating_duration_since(last))
                .unwrap_or(Duration::ZERO);
            self.jittered_base().saturating_sub(elapsed)
        };

        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(now);

        if delay.is_zero() {
            tracing::trace!(timer = ?self.timer_id, attempt = self.attempts, "Backoff elapsed, running now");
            self.queue.enqueue(operation);
        } else {
            tracing::debug!(
                timer = ?self.timer_id,
                attempt = self.attempts,
                delay = ?delay,
                base = ?self.current_base,
                "Backing off before next attempt"
            );
            self.pending = Some(self.queue.enqueue_after_delay(delay, self.timer_id, operation));
        }

        self.current_base = self.grown_base();
    }

    /// Forget past failures; the next attempt runs without delay
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
        self.attempts = 0;
    }

    /// Make the next attempt wait the maximum delay
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay();
    }

    /// Skip the delay for the next attempt only
    pub fn inhibit(&mut self) {
        self.inhibited = true;
    }

    /// Cancel a scheduled attempt, if any
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }

    /// Whether an attempt is waiting on the backoff timer
    pub fn is_scheduled(&self) -> bool {
        self.pending
            .as_ref()
            .map(DelayedOperation::is_pending)
            .unwrap_or(false)
    }

    /// Base delay the next attempt will use, before jitter
    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Timer the delayed attempts are scheduled under
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    fn jittered_base(&self) -> Duration {
        let base = self.current_base.as_secs_f64();
        let spread = base * self.config.jitter_factor;
        if spread <= 0.0 {
            return self.current_base;
        }
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base + jitter).max(0.0))
    }

    fn grown_base(&self) -> Duration {
        let max = self.config.max_delay();
        let grown = self.current_base.as_secs_f64() * self.config.multiplier;
        Duration::try_from_secs_f64(grown)
            .unwrap_or(max)
            .clamp(self.config.initial_delay(), max)
    }
}

impl Drop for BackoffController {
    fn drop(&mut self) {
        self.cancel();
    }
}
