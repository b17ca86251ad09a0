//! Idle timeout for open streams

use crate::queue::{AsyncQueue, DelayedOperation, TimerId};
use std::sync::Arc;
use std::time::Duration;

/// Single-shot idle timer scheduled on the worker queue
#[derive(Debug)]
pub struct IdleTimer {
    queue: Arc<AsyncQueue>,
    timer_id: TimerId,
    timeout: Duration,
    pending: Option<DelayedOperation>,
}

impl IdleTimer {
    pub fn new(queue: Arc<AsyncQueue>, timer_id: TimerId, timeout: Duration) -> Self {
        Self {
            queue,
            timer_id,
            timeout,
            pending: None,
        }
    }

    /// Run `operation` once the timeout elapses
    ///
    /// Returns `false` without scheduling anything if the timer is already
    /// running; the earlier deadline stands.
    pub fn schedule(&mut self, operation: impl FnOnce() + Send + 'static) -> bool {
        if self.is_scheduled() {
            return false;
        }
        self.pending = Some(
            self.queue
                .enqueue_after_delay(self.timeout, self.timer_id, operation),
        );
        true
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.pending
            .as_ref()
            .map(DelayedOperation::is_pending)
            .unwrap_or(false)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
