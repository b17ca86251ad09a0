//! Serialized worker queue
//!
//! `AsyncQueue` runs every operation submitted to it one at a time, in
//! submission order, on a single dedicated worker thread. All stream state
//! is confined to that thread, so callbacks arriving from the credential
//! provider or the transport must be funneled back onto the queue before
//! they touch anything.
//!
//! Delayed operations are tracked by [`TimerId`] so tests can ask whether a
//! timer is scheduled and fast-forward through it deterministically. The
//! timers themselves (and asynchronous credential requests) are driven by a
//! small tokio runtime owned by the queue; when a timer fires its operation
//! is enqueued like any other.

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A unit of work executed on the worker thread
pub type Operation = Box<dyn FnOnce() + Send + 'static>;

/// Well-known timer categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerId {
    /// Idle timeout of the listen stream
    ListenStreamIdle,
    /// Reconnect backoff of the listen stream
    ListenStreamConnectionBackoff,
    /// Idle timeout of the write stream
    WriteStreamIdle,
    /// Reconnect backoff of the write stream
    WriteStreamConnectionBackoff,
}

enum Message {
    Run(Operation),
    Shutdown,
}

struct ScheduledOperation {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    operation: Operation,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Schedule {
    next_id: u64,
    operations: Vec<ScheduledOperation>,
}

impl Schedule {
    fn take(&mut self, id: u64) -> Option<ScheduledOperation> {
        let index = self.operations.iter().position(|op| op.id == id)?;
        Some(self.operations.remove(index))
    }

    fn take_earliest(&mut self) -> Option<ScheduledOperation> {
        let index = self
            .operations
            .iter()
            .enumerate()
            .min_by_key(|(_, op)| (op.target_time, op.id))
            .map(|(index, _)| index)?;
        Some(self.operations.remove(index))
    }

    fn contains(&self, timer_id: TimerId) -> bool {
        self.operations.iter().any(|op| op.timer_id == timer_id)
    }
}

/// Serialized task executor with named timers
///
/// Create one with [`AsyncQueue::new`] and share it via `Arc`. Call
/// [`AsyncQueue::shutdown`] when done; dropping the last reference does the
/// same.
pub struct AsyncQueue {
    name: String,
    sender: mpsc::UnboundedSender<Message>,
    schedule: Mutex<Schedule>,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    worker_id: ThreadId,
    shut_down: AtomicBool,
    this: Weak<AsyncQueue>,
}

impl AsyncQueue {
    /// Start a new queue with its own worker thread
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{}-timers", name))
            .enable_time()
            .build()
            .map_err(|e| {
                StreamError::Queue(format!("Failed to start runtime for '{}': {}", name, e))
            })?;
        let handle = runtime.handle().clone();

        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(receiver))
            .map_err(|e| {
                StreamError::Queue(format!("Failed to spawn worker '{}': {}", name, e))
            })?;
        let worker_id = worker.thread().id();

        tracing::debug!(queue = %name, "Worker queue started");

        Ok(Arc::new_cyclic(|this| Self {
            name,
            sender,
            schedule: Mutex::new(Schedule::default()),
            handle,
            runtime: Mutex::new(Some(runtime)),
            worker: Mutex::new(Some(worker)),
            worker_id,
            shut_down: AtomicBool::new(false),
            this: this.clone(),
        }))
    }

    /// Queue name, used as the worker thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit an operation without waiting for it to run
    pub fn enqueue(&self, operation: impl FnOnce() + Send + 'static) {
        self.submit(Box::new(operation));
    }

    /// Submit an operation and block until it has run, returning its result
    ///
    /// # Panics
    ///
    /// Panics when called from the worker thread itself (it would deadlock),
    /// when the queue shuts down before the operation runs, and re-raises any
    /// panic raised by the operation. Must not be called from async context.
    pub fn enqueue_blocking<F, R>(&self, operation: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        assert!(
            !self.is_current_queue(),
            "enqueue_blocking called from worker queue '{}' would deadlock",
            self.name
        );

        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move || {
            let _ = tx.send(panic::catch_unwind(AssertUnwindSafe(operation)));
        }));

        match rx.blocking_recv() {
            Ok(Ok(value)) => value,
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => panic!(
                "worker queue '{}' shut down before the operation ran",
                self.name
            ),
        }
    }

    /// Schedule an operation to run after `delay`
    ///
    /// At most one operation per `TimerId` is expected to be scheduled at a
    /// time.
    pub fn enqueue_after_delay(
        &self,
        delay: Duration,
        timer_id: TimerId,
        operation: impl FnOnce() + Send + 'static,
    ) -> DelayedOperation {
        let mut schedule = self.lock_schedule();
        debug_assert!(
            !schedule.contains(timer_id),
            "timer {:?} is already scheduled",
            timer_id
        );

        let id = schedule.next_id;
        schedule.next_id += 1;

        if self.shut_down.load(Ordering::Acquire) {
            tracing::warn!(queue = %self.name, timer = ?timer_id, "Dropping timer scheduled after shutdown");
            return DelayedOperation {
                id,
                timer_id,
                queue: Weak::new(),
            };
        }

        let queue = self.this.clone();
        let timer = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                let target = Arc::downgrade(&queue);
                queue.enqueue(move || {
                    if let Some(queue) = target.upgrade() {
                        queue.run_scheduled(id);
                    }
                });
            }
        });

        schedule.operations.push(ScheduledOperation {
            id,
            timer_id,
            target_time: Instant::now() + delay,
            operation: Box::new(operation),
            timer,
        });

        tracing::trace!(queue = %self.name, timer = ?timer_id, delay = ?delay, "Timer scheduled");

        DelayedOperation {
            id,
            timer_id,
            queue: self.this.clone(),
        }
    }

    /// Whether an operation with the given timer id is currently scheduled
    pub fn is_scheduled(&self, timer_id: TimerId) -> bool {
        self.lock_schedule().contains(timer_id)
    }

    /// Run scheduled operations in target-time order, up to and including
    /// the first one tagged `last_timer_id`, without waiting for their
    /// delays to elapse
    ///
    /// # Panics
    ///
    /// Panics if no operation with `last_timer_id` is scheduled, and under
    /// the same conditions as [`AsyncQueue::enqueue_blocking`].
    pub fn run_scheduled_operations_until(&self, last_timer_id: TimerId) {
        assert!(
            self.is_scheduled(last_timer_id),
            "timer {:?} is not scheduled on queue '{}'",
            last_timer_id,
            self.name
        );

        let queue = self.this.clone();
        self.enqueue_blocking(move || {
            let Some(queue) = queue.upgrade() else {
                return;
            };
            loop {
                let next = queue.lock_schedule().take_earliest();
                let Some(next) = next else {
                    break;
                };
                next.timer.abort();
                let timer_id = next.timer_id;
                tracing::trace!(queue = %queue.name, timer = ?timer_id, "Fast-forwarding timer");
                (next.operation)();
                if timer_id == last_timer_id {
                    break;
                }
            }
        });
    }

    /// Whether the caller is running on this queue's worker thread
    pub fn is_current_queue(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Assert (in debug builds) that the caller runs on the worker thread
    pub fn verify_is_current_queue(&self) {
        debug_assert!(
            self.is_current_queue(),
            "operation must run on worker queue '{}'",
            self.name
        );
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Cancel all timers and stop the worker thread and runtime
    ///
    /// Operations already submitted ahead of the shutdown still run.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancelled = std::mem::take(&mut self.lock_schedule().operations);
        for op in &cancelled {
            op.timer.abort();
        }
        drop(cancelled);

        let _ = self.sender.send(Message::Shutdown);

        if !self.is_current_queue() {
            let worker = self
                .worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(worker) = worker {
                if worker.join().is_err() {
                    tracing::error!(queue = %self.name, "Worker thread panicked");
                }
            }
        }

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }

        tracing::debug!(queue = %self.name, "Worker queue shut down");
    }

    /// Spawn a future on the queue's runtime
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            tracing::warn!(queue = %self.name, "Dropping task spawned after shutdown");
            return;
        }
        self.handle.spawn(future);
    }

    /// Handle to the queue's runtime, for entering its context
    pub(crate) fn runtime_handle(&self) -> &Handle {
        &self.handle
    }

    fn submit(&self, operation: Operation) {
        if self.is_shut_down() {
            tracing::warn!(queue = %self.name, "Dropping operation enqueued after shutdown");
            return;
        }
        if self.sender.send(Message::Run(operation)).is_err() {
            tracing::warn!(queue = %self.name, "Worker stopped, operation dropped");
        }
    }

    fn run_scheduled(&self, id: u64) {
        let scheduled = self.lock_schedule().take(id);
        if let Some(scheduled) = scheduled {
            tracing::trace!(queue = %self.name, timer = ?scheduled.timer_id, "Timer fired");
            (scheduled.operation)();
        }
    }

    fn lock_schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("name", &self.name)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Drop for AsyncQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(mut receiver: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = receiver.blocking_recv() {
        match message {
            Message::Run(operation) => {
                if panic::catch_unwind(AssertUnwindSafe(operation)).is_err() {
                    tracing::error!("Operation panicked on worker queue");
                }
            }
            Message::Shutdown => break,
        }
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`]
#[derive(Debug)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: Weak<AsyncQueue>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Remove the operation from the schedule; no-op if it already ran
    pub fn cancel(&self) {
        if let Some(queue) = self.queue.upgrade() {
            let cancelled = queue.lock_schedule().take(self.id);
            if let Some(cancelled) = cancelled {
                cancelled.timer.abort();
                tracing::trace!(queue = %queue.name, timer = ?self.timer_id, "Timer cancelled");
            }
        }
    }

    /// Whether the operation is still waiting to run
    pub fn is_pending(&self) -> bool {
        self.queue
            .upgrade()
            .map(|queue| queue.lock_schedule().operations.iter().any(|op| op.id == self.id))
            .unwrap_or(false)
    }
}
