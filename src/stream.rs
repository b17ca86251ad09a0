//! Stream lifecycle controller
//!
//! A `Stream` owns one logical bidirectional stream: it fetches a token,
//! creates a channel bound to it, keeps exactly one read outstanding while
//! open, turns transport failures into a single close notification, and
//! arranges backoff and token invalidation for the next `start()`.
//!
//! All public operations must be called on the worker queue the stream was
//! created with. Token results, transport completions and timer callbacks
//! are funneled back onto that queue and checked against the attempt
//! generation they were issued for; anything from a superseded attempt is
//! dropped, so no observer callback fires after `stop()` returns.
//!
//! ```text
//! Initial --start--> Starting --open ok--> Open
//!    ^                  |                    |
//!    |                  +---- close(!ok) ----+--> Error --start--> Backoff
//!    +------- stop / close(ok) / auth failure                        |
//!                                         Starting <--timer fired----+
//! ```

use crate::backoff::BackoffController;
use crate::config::StreamConfig;
use crate::credentials::{CredentialsProvider, Token};
use crate::error::{Result, StreamError};
use crate::idle::IdleTimer;
use crate::queue::AsyncQueue;
use crate::status::{Code, Status};
use crate::transport::{AttemptContext, Channel, ChannelFactory, Completion, CompletionSink};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

/// Receives stream events; invoked only on the worker queue
///
/// Callbacks run without any stream lock held, so they may call back into
/// the stream (write from `on_open`, start again from `on_close`).
pub trait StreamObserver: Send + Sync {
    /// The stream is open and writable
    fn on_open(&self);

    /// A message arrived
    ///
    /// Returning an error tears the stream down and closes it with the
    /// returned status.
    fn on_response(&self, message: Bytes) -> std::result::Result<(), Status>;

    /// The stream closed; `status` is OK for a requested stop or idle close
    fn on_close(&self, status: Status);
}

/// Lifecycle state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not started
    Initial,
    /// Waiting for a token or for the channel to open
    Starting,
    Open,
    /// Waiting for the backoff timer before authenticating
    Backoff,
    /// Closed by a failure; the next start backs off first
    Error,
}

impl StreamState {
    /// Starting, open, or backing off
    pub fn is_started(self) -> bool {
        matches!(
            self,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Initial => "initial",
            StreamState::Starting => "starting",
            StreamState::Open => "open",
            StreamState::Backoff => "backoff",
            StreamState::Error => "error",
        };
        f.write_str(name)
    }
}

struct StreamCore {
    state: StreamState,
    generation: u64,
    channel: Option<Box<dyn Channel>>,
    finishing: bool,
    backoff: BackoffController,
    idle: IdleTimer,
}

impl StreamCore {
    /// Supersede every callback issued so far
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

struct StreamInner {
    name: String,
    queue: Arc<AsyncQueue>,
    credentials: Arc<dyn CredentialsProvider>,
    channel_factory: Arc<dyn ChannelFactory>,
    observer: Arc<dyn StreamObserver>,
    core: Mutex<StreamCore>,
    this: Weak<StreamInner>,
}

/// Restartable, authenticated bidirectional stream
///
/// Cheap to clone; clones share the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    /// Create a stream in the `Initial` state
    pub fn new(
        queue: Arc<AsyncQueue>,
        credentials: Arc<dyn CredentialsProvider>,
        channel_factory: Arc<dyn ChannelFactory>,
        observer: Arc<dyn StreamObserver>,
        config: StreamConfig,
    ) -> Result<Self> {
        config.validate()?;

        let backoff = BackoffController::new(
            Arc::clone(&queue),
            config.backoff_timer_id,
            config.backoff.clone(),
        );
        let idle = IdleTimer::new(
            Arc::clone(&queue),
            config.idle_timer_id,
            config.idle_timeout(),
        );

        tracing::debug!(stream = %config.debug_name, queue = %queue.name(), "Stream created");

        let inner = Arc::new_cyclic(|this| StreamInner {
            name: config.debug_name,
            queue,
            credentials,
            channel_factory,
            observer,
            core: Mutex::new(StreamCore {
                state: StreamState::Initial,
                generation: 0,
                channel: None,
                finishing: false,
                backoff,
                idle,
            }),
            this: this.clone(),
        });

        Ok(Self { inner })
    }

    /// Begin a new attempt
    ///
    /// After a failure the attempt first waits out the backoff delay.
    /// Returns [`StreamError::AlreadyStarted`] if the stream is started.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Tear the stream down synchronously; no-op if not started
    ///
    /// Blocks until the transport acknowledges teardown, which requires the
    /// transport's completion source to be serviced by another thread. The
    /// observer sees a clean close only if the stream was open.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Send a message; returns [`StreamError::NotOpen`] unless open
    pub fn write(&self, message: impl Into<Bytes>) -> Result<()> {
        self.inner.write(message.into())
    }

    /// Schedule a clean close after the idle timeout, if open and not
    /// already scheduled
    pub fn mark_idle(&self) {
        self.inner.mark_idle();
    }

    /// Cancel a scheduled idle close; no-op if none is scheduled
    pub fn cancel_idle_check(&self) {
        self.inner.queue.verify_is_current_queue();
        self.inner.lock().idle.cancel();
    }

    /// Make the next backoff delay zero
    pub fn inhibit_backoff(&self) {
        self.inner.queue.verify_is_current_queue();
        let mut core = self.inner.lock();
        tracing::debug!(stream = %self.inner.name, state = %core.state, "Backoff inhibited");
        core.backoff.inhibit();
    }

    /// Whether the stream is starting, open, or waiting out a backoff
    pub fn is_started(&self) -> bool {
        self.inner.lock().state.is_started()
    }

    /// Whether the channel is open and the stream accepts writes
    pub fn is_open(&self) -> bool {
        self.inner.lock().state == StreamState::Open
    }

    /// Current lifecycle state
    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Debug name from the stream's configuration
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamInner {
    fn lock(&self) -> MutexGuard<'_, StreamCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self) -> Result<()> {
        self.queue.verify_is_current_queue();
        let mut core = self.lock();

        match core.state {
            StreamState::Initial => {}
            StreamState::Error => {
                core.state = StreamState::Backoff;
                let generation = core.next_generation();
                let this = self.this.clone();
                core.backoff.backoff_and_run(move || {
                    if let Some(inner) = this.upgrade() {
                        inner.resume_after_backoff(generation);
                    }
                });
                tracing::debug!(stream = %self.name, generation, "Restarting after backoff");
                return Ok(());
            }
            state => {
                let err = StreamError::AlreadyStarted {
                    stream: self.name.clone(),
                    state: state.to_string(),
                };
                tracing::error!(stream = %self.name, "{}", err);
                return Err(err);
            }
        }

        core.backoff.cancel();
        core.state = StreamState::Starting;
        let generation = core.next_generation();
        drop(core);

        tracing::debug!(stream = %self.name, generation, "Stream starting");
        self.authenticate(generation);
        Ok(())
    }

    fn resume_after_backoff(&self, generation: u64) {
        let mut core = self.lock();
        if core.generation != generation || core.state != StreamState::Backoff {
            tracing::trace!(stream = %self.name, generation, "Stale backoff timer ignored");
            return;
        }

        core.state = StreamState::Starting;
        let generation = core.next_generation();
        drop(core);

        tracing::debug!(stream = %self.name, generation, "Backoff elapsed, stream starting");
        self.authenticate(generation);
    }

    /// Request a token and continue on the worker queue once it resolves
    ///
    /// The request is polled once right away so providers holding a cached
    /// token resolve without a runtime round trip.
    fn authenticate(&self, generation: u64) {
        let credentials = Arc::clone(&self.credentials);
        let mut request: BoxFuture<'static, Result<Token>> =
            Box::pin(async move { credentials.get_token().await });

        let polled = {
            let _runtime = self.queue.runtime_handle().enter();
            let mut cx = Context::from_waker(futures::task::noop_waker_ref());
            request.as_mut().poll(&mut cx)
        };

        let this = self.this.clone();
        match polled {
            Poll::Ready(result) => self.queue.enqueue(move || {
                if let Some(inner) = this.upgrade() {
                    inner.resume_after_token(generation, result);
                }
            }),
            Poll::Pending => {
                let queue = Arc::downgrade(&self.queue);
                self.queue.spawn(async move {
                    let result = request.await;
                    // The stream may be long gone by now
                    if let Some(queue) = queue.upgrade() {
                        queue.enqueue(move || {
                            if let Some(inner) = this.upgrade() {
                                inner.resume_after_token(generation, result);
                            }
                        });
                    }
                });
            }
        }
    }

    fn resume_after_token(&self, generation: u64, token: Result<Token>) {
        let mut core = self.lock();
        if core.generation != generation || core.state != StreamState::Starting {
            tracing::trace!(stream = %self.name, generation, "Stale token response ignored");
            return;
        }

        match token {
            Ok(token) => {
                let sink = self.completion_sink(generation);
                let mut channel = self
                    .channel_factory
                    .create_channel(AttemptContext { generation, token }, sink);
                channel.open();
                core.channel = Some(channel);
                core.finishing = false;
                tracing::debug!(stream = %self.name, generation, "Channel created, opening");
            }
            Err(err) => {
                core.state = StreamState::Initial;
                core.next_generation();
                drop(core);

                tracing::warn!(stream = %self.name, error = %err, "Failed to fetch token");
                self.observer
                    .on_close(Status::new(Code::Unknown, err.to_string()));
            }
        }
    }

    fn completion_sink(&self, generation: u64) -> CompletionSink {
        let this = self.this.clone();
        CompletionSink::new(generation, &self.queue, move |generation, completion| {
            if let Some(inner) = this.upgrade() {
                inner.handle_completion(generation, completion);
            }
        })
    }

    fn handle_completion(&self, generation: u64, completion: Completion) {
        let kind = completion.kind();
        let mut core = self.lock();
        if core.generation != generation || core.channel.is_none() {
            tracing::trace!(
                stream = %self.name,
                generation,
                kind = ?kind,
                "Stale completion ignored"
            );
            return;
        }

        match completion {
            Completion::Open { ok: true } => {
                if core.state != StreamState::Starting {
                    return;
                }
                core.state = StreamState::Open;
                core.backoff.reset();
                drop(core);

                tracing::debug!(stream = %self.name, generation, "Stream open");
                self.observer.on_open();
                self.read_next(generation);
            }
            Completion::Read { ok: true, message } => {
                if core.finishing || core.state != StreamState::Open {
                    return;
                }
                drop(core);

                match self.observer.on_response(message) {
                    Ok(()) => self.read_next(generation),
                    Err(status) => self.fail_locally(generation, status),
                }
            }
            Completion::Write { ok: true } => {
                tracing::trace!(stream = %self.name, generation, "Write flushed");
            }
            Completion::Open { ok: false }
            | Completion::Read { ok: false, .. }
            | Completion::Write { ok: false } => {
                if core.finishing {
                    return;
                }
                core.finishing = true;
                tracing::debug!(
                    stream = %self.name,
                    generation,
                    kind = ?kind,
                    "Operation failed, finishing stream"
                );
                if let Some(channel) = core.channel.as_mut() {
                    channel.finish();
                }
            }
            Completion::Finish { status } => {
                drop(core);
                self.close(generation, status);
            }
        }
    }

    fn read_next(&self, generation: u64) {
        let mut core = self.lock();
        if core.generation != generation || core.state != StreamState::Open || core.finishing {
            return;
        }
        if let Some(channel) = core.channel.as_mut() {
            channel.read();
        }
    }

    /// Tear the channel down after the observer rejected a message
    fn fail_locally(&self, generation: u64, status: Status) {
        let mut core = self.lock();
        if core.generation != generation {
            return;
        }
        let channel = core.channel.take();
        drop(core);

        tracing::warn!(stream = %self.name, status = %status, "Response handling failed, tearing down");
        if let Some(mut channel) = channel {
            channel.finish_immediately();
        }
        self.close(generation, status);
    }

    fn close(&self, generation: u64, status: Status) {
        let mut core = self.lock();
        if core.generation != generation {
            return;
        }

        core.idle.cancel();
        core.backoff.cancel();
        let channel = core.channel.take();
        core.finishing = false;
        core.next_generation();

        // Overloaded backend: skip straight to the longest delay
        if status.code() == Code::ResourceExhausted {
            core.backoff.reset_to_max();
        }
        core.state = if status.is_ok() {
            StreamState::Initial
        } else {
            StreamState::Error
        };
        drop(core);
        drop(channel);

        if status.code() == Code::Unauthenticated {
            self.credentials.invalidate_token();
        }

        if status.is_ok() {
            tracing::debug!(stream = %self.name, "Stream closed");
        } else {
            tracing::warn!(stream = %self.name, status = %status, "Stream closed with error");
        }
        self.observer.on_close(status);
    }

    fn stop(&self) {
        self.queue.verify_is_current_queue();
        let mut core = self.lock();
        if !core.state.is_started() {
            return;
        }

        core.idle.cancel();
        core.backoff.cancel();
        let was_open = core.state == StreamState::Open;
        let channel = core.channel.take();
        core.finishing = false;
        core.state = StreamState::Initial;
        core.next_generation();
        drop(core);

        if let Some(mut channel) = channel {
            let status = channel.finish_immediately();
            tracing::trace!(stream = %self.name, status = %status, "Channel torn down");
        }

        tracing::debug!(stream = %self.name, was_open, "Stream stopped");
        if was_open {
            self.observer.on_close(Status::ok());
        }
    }

    fn write(&self, message: Bytes) -> Result<()> {
        self.queue.verify_is_current_queue();
        let mut core = self.lock();
        if core.state != StreamState::Open {
            let err = StreamError::NotOpen {
                stream: self.name.clone(),
                state: core.state.to_string(),
            };
            tracing::error!(stream = %self.name, "{}", err);
            return Err(err);
        }

        core.idle.cancel();
        if let Some(channel) = core.channel.as_mut() {
            tracing::trace!(stream = %self.name, bytes = message.len(), "Writing message");
            channel.write(message);
        }
        Ok(())
    }

    fn mark_idle(&self) {
        self.queue.verify_is_current_queue();
        let mut core = self.lock();
        if core.state != StreamState::Open {
            return;
        }

        let generation = core.generation;
        let this = self.this.clone();
        let scheduled = core.idle.schedule(move || {
            if let Some(inner) = this.upgrade() {
                inner.close_idle(generation);
            }
        });
        if scheduled {
            tracing::debug!(stream = %self.name, timeout = ?core.idle.timeout(), "Idle check scheduled");
        }
    }

    fn close_idle(&self, generation: u64) {
        let core = self.lock();
        if core.generation != generation || core.state != StreamState::Open {
            return;
        }
        drop(core);

        tracing::info!(stream = %self.name, "Closing idle stream");
        self.stop();
    }
}
