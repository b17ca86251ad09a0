//! Transport boundary: channels, completions, and the channel factory
//!
//! A `Channel` is one connection attempt's handle onto the underlying
//! bidirectional RPC. The controller issues operations on it (open, read,
//! write, finish) and the transport reports each operation's outcome later,
//! from whatever thread polls its completion source, through the
//! `CompletionSink` it was created with. The sink funnels every completion
//! onto the worker queue, stamped with the attempt it belongs to.

use crate::credentials::Token;
use crate::queue::AsyncQueue;
use crate::status::Status;
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Weak};

pub mod tester;

/// Kind of operation a completion reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionKind {
    Open,
    Read,
    Write,
    Finish,
}

/// Outcome of an operation issued on a channel
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The call was established (or failed to be)
    Open { ok: bool },
    /// A message arrived; `message` is meaningful only when `ok`
    Read { ok: bool, message: Bytes },
    /// A write was flushed (or failed)
    Write { ok: bool },
    /// The call terminated with its definitive status
    Finish { status: Status },
}

impl Completion {
    pub fn kind(&self) -> CompletionKind {
        match self {
            Completion::Open { .. } => CompletionKind::Open,
            Completion::Read { .. } => CompletionKind::Read,
            Completion::Write { .. } => CompletionKind::Write,
            Completion::Finish { .. } => CompletionKind::Finish,
        }
    }

    /// Whether the operation succeeded; a finish always "succeeds" in
    /// delivering its status
    pub fn ok(&self) -> bool {
        match self {
            Completion::Open { ok } | Completion::Read { ok, .. } | Completion::Write { ok } => *ok,
            Completion::Finish { .. } => true,
        }
    }
}

/// What a channel is bound to for the duration of one attempt
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Attempt generation; completions are matched against it
    pub generation: u64,
    /// Token fetched for this attempt
    pub token: Token,
}

type Dispatch = Arc<dyn Fn(u64, Completion) + Send + Sync>;

/// Delivers completions of one attempt back onto the worker queue
///
/// Cheap to clone; safe to call from any thread, including after the
/// stream that created it is gone.
#[derive(Clone)]
pub struct CompletionSink {
    generation: u64,
    queue: Weak<AsyncQueue>,
    dispatch: Dispatch,
}

impl CompletionSink {
    pub(crate) fn new(
        generation: u64,
        queue: &Arc<AsyncQueue>,
        dispatch: impl Fn(u64, Completion) + Send + Sync + 'static,
    ) -> Self {
        Self {
            generation,
            queue: Arc::downgrade(queue),
            dispatch: Arc::new(dispatch),
        }
    }

    /// Generation of the attempt this sink belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report a completion; it is handled later on the worker queue
    pub fn complete(&self, completion: Completion) {
        let Some(queue) = self.queue.upgrade() else {
            tracing::trace!(
                generation = self.generation,
                kind = ?completion.kind(),
                "Completion dropped, worker queue is gone"
            );
            return;
        };

        let dispatch = Arc::clone(&self.dispatch);
        let generation = self.generation;
        queue.enqueue(move || dispatch(generation, completion));
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Transport handle for a single connection attempt
///
/// Every operation except `finish_immediately` returns at once and reports
/// its outcome through the attempt's `CompletionSink`. At most one read is
/// outstanding at a time; writes may be issued back to back.
pub trait Channel: Send {
    /// Establish the call
    fn open(&mut self);

    /// Request the next inbound message
    fn read(&mut self);

    /// Send a message
    fn write(&mut self, message: Bytes);

    /// Request the call's terminal status, reported as `Completion::Finish`
    fn finish(&mut self);

    /// Cancel the call and block until the transport acknowledges teardown
    ///
    /// Acknowledgment arrives through the transport's completion source, so
    /// that source must be serviced by another thread while this blocks;
    /// otherwise it waits forever. Completions of the cancelled operations
    /// may still be reported through the sink afterwards.
    fn finish_immediately(&mut self) -> Status;
}

/// Creates one channel per connection attempt
pub trait ChannelFactory: Send + Sync {
    /// Create a channel bound to `context.token`, reporting into `sink`
    fn create_channel(&self, context: AttemptContext, sink: CompletionSink) -> Box<dyn Channel>;
}
