//! Fake transport for driving a stream deterministically in tests
//!
//! `ChannelTester` is a `ChannelFactory` whose channels never touch the
//! network. Every operation a channel issues is parked in a pending
//! completion queue until the test decides how it ends, via `force_finish`
//! or `force_finish_with`. Blocking teardown (`finish_immediately`) is only
//! acknowledged once `keep_polling` has started the background poller,
//! which mirrors the operational requirement real transports impose.

use super::{AttemptContext, Channel, ChannelFactory, Completion, CompletionKind, CompletionSink};
use crate::credentials::Token;
use crate::queue::AsyncQueue;
use crate::status::{Code, Status};
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const COMPLETION_WAIT: Duration = Duration::from_secs(5);

/// An operation issued by a fake channel, waiting to be completed
pub struct PendingCompletion {
    channel_id: u64,
    kind: CompletionKind,
    sink: CompletionSink,
    teardown: Option<oneshot::Sender<Status>>,
}

impl PendingCompletion {
    pub fn kind(&self) -> CompletionKind {
        self.kind
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Complete with a bare success flag; reads deliver an empty message
    pub fn complete(self, ok: bool) {
        match self.kind {
            CompletionKind::Open => self.sink.complete(Completion::Open { ok }),
            CompletionKind::Read => self.sink.complete(Completion::Read {
                ok,
                message: Bytes::new(),
            }),
            CompletionKind::Write => self.sink.complete(Completion::Write { ok }),
            CompletionKind::Finish => {
                let status = if ok {
                    Status::ok()
                } else {
                    Status::new(Code::Unknown, "finish failed")
                };
                self.complete_with_status(status);
            }
        }
    }

    /// Complete a read successfully with the given payload
    pub fn complete_with_message(self, message: impl Into<Bytes>) {
        debug_assert_eq!(self.kind, CompletionKind::Read);
        self.sink.complete(Completion::Read {
            ok: true,
            message: message.into(),
        });
    }

    /// Complete a finish with the given terminal status
    pub fn complete_with_status(self, status: Status) {
        debug_assert_eq!(self.kind, CompletionKind::Finish);
        match self.teardown {
            Some(teardown) => {
                let _ = teardown.send(status);
            }
            None => self.sink.complete(Completion::Finish { status }),
        }
    }
}

enum Outcome {
    Ok,
    Error,
    Message(Bytes),
    Status(Status),
}

/// How a forced completion should end
pub struct CompletionEndState {
    kind: CompletionKind,
    outcome: Outcome,
}

impl CompletionEndState {
    /// Succeed an operation of the given kind
    pub fn ok(kind: CompletionKind) -> Self {
        Self {
            kind,
            outcome: Outcome::Ok,
        }
    }

    /// Fail an operation of the given kind
    pub fn error(kind: CompletionKind) -> Self {
        Self {
            kind,
            outcome: Outcome::Error,
        }
    }

    /// Succeed a read with a payload
    pub fn read(message: impl Into<Bytes>) -> Self {
        Self {
            kind: CompletionKind::Read,
            outcome: Outcome::Message(message.into()),
        }
    }

    /// Finish the call with a status
    pub fn finish(status: Status) -> Self {
        Self {
            kind: CompletionKind::Finish,
            outcome: Outcome::Status(status),
        }
    }

    fn apply(self, pending: PendingCompletion) {
        match self.outcome {
            Outcome::Ok => pending.complete(true),
            Outcome::Error => pending.complete(false),
            Outcome::Message(message) => pending.complete_with_message(message),
            Outcome::Status(status) => pending.complete_with_status(status),
        }
    }
}

#[derive(Default)]
struct TesterState {
    next_channel_id: u64,
    latest_channel: Option<u64>,
    cancelled: HashSet<u64>,
    pending: VecDeque<PendingCompletion>,
    tokens: Vec<Token>,
    written: Vec<Bytes>,
    shut_down: bool,
}

#[derive(Default)]
struct TesterShared {
    state: Mutex<TesterState>,
    changed: Condvar,
    poller: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TesterShared {
    fn lock(&self) -> MutexGuard<'_, TesterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, pending: PendingCompletion) {
        self.lock().pending.push_back(pending);
        self.changed.notify_all();
    }
}

/// Fake channel factory with a controllable completion queue
#[derive(Clone)]
pub struct ChannelTester {
    queue: Arc<AsyncQueue>,
    shared: Arc<TesterShared>,
}

impl ChannelTester {
    /// Create a tester whose forced completions are flushed through `queue`
    pub fn new(queue: Arc<AsyncQueue>) -> Self {
        Self {
            queue,
            shared: Arc::new(TesterShared::default()),
        }
    }

    /// Complete operations of the most recent channel, one end state at a
    /// time, waiting for each operation to be issued; then wait until the
    /// worker queue has handled the completions
    ///
    /// # Panics
    ///
    /// Panics if an expected operation is not issued within a few seconds.
    pub fn force_finish(&self, end_states: impl IntoIterator<Item = CompletionEndState>) {
        for end_state in end_states {
            let kind = end_state.kind;
            let pending = self.take_pending(None, |pending| pending.kind == kind);
            end_state.apply(pending);
        }
        self.queue.enqueue_blocking(|| {});
    }

    /// Like `force_finish`, but for the channel with the given id, which
    /// need not be the most recent one
    pub fn force_finish_channel(
        &self,
        channel_id: u64,
        end_states: impl IntoIterator<Item = CompletionEndState>,
    ) {
        for end_state in end_states {
            let kind = end_state.kind;
            let pending = self.take_pending(Some(channel_id), |pending| pending.kind == kind);
            end_state.apply(pending);
        }
        self.queue.enqueue_blocking(|| {});
    }

    /// Hand operations of the most recent channel to `callback`, in the
    /// order they were issued, until it returns `true`; then wait until the
    /// worker queue has handled the completions
    ///
    /// The callback must complete every operation it receives.
    pub fn force_finish_with(&self, mut callback: impl FnMut(PendingCompletion) -> bool) {
        loop {
            let pending = self.take_pending(None, |_| true);
            if callback(pending) {
                break;
            }
        }
        self.queue.enqueue_blocking(|| {});
    }

    /// Start servicing torn-down channels in the background
    ///
    /// Without this, `finish_immediately` on a fake channel blocks forever.
    pub fn keep_polling(&self) {
        let mut poller = self
            .shared
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        *poller = Some(
            thread::Builder::new()
                .name("channel-tester-poller".to_string())
                .spawn(move || poll_cancelled(shared))
                .unwrap_or_else(|e| panic!("failed to spawn poller: {}", e)),
        );
    }

    /// Stop the poller and release every parked operation
    pub fn shutdown(&self) {
        let parked = {
            let mut state = self.shared.lock();
            state.shut_down = true;
            std::mem::take(&mut state.pending)
        };
        self.shared.changed.notify_all();
        drop(parked);

        let poller = self
            .shared
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            let _ = poller.join();
        }
    }

    /// Tokens the channels were created with, in creation order
    pub fn channel_tokens(&self) -> Vec<Token> {
        self.shared.lock().tokens.clone()
    }

    /// Number of channels created so far
    pub fn channel_count(&self) -> usize {
        self.shared.lock().tokens.len()
    }

    /// Every message written through any channel, in order
    pub fn written_messages(&self) -> Vec<Bytes> {
        self.shared.lock().written.clone()
    }

    /// Id of the most recently created channel
    pub fn latest_channel_id(&self) -> Option<u64> {
        self.shared.lock().latest_channel
    }

    /// Kinds of the operations the most recent channel has outstanding
    pub fn pending_kinds(&self) -> Vec<CompletionKind> {
        let state = self.shared.lock();
        state
            .pending
            .iter()
            .filter(|pending| Some(pending.channel_id) == state.latest_channel)
            .map(|pending| pending.kind)
            .collect()
    }

    /// Wait for a matching operation on `channel`, or on the most recent
    /// channel when `None`
    fn take_pending(
        &self,
        channel: Option<u64>,
        matches: impl Fn(&PendingCompletion) -> bool,
    ) -> PendingCompletion {
        let deadline = Instant::now() + COMPLETION_WAIT;
        let mut state = self.shared.lock();
        loop {
            let latest = channel.or(state.latest_channel);
            let found = state
                .pending
                .iter()
                .position(|pending| Some(pending.channel_id) == latest && matches(pending));
            if let Some(index) = found {
                if let Some(pending) = state.pending.remove(index) {
                    return pending;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let kinds: Vec<_> = state.pending.iter().map(|p| (p.channel_id, p.kind)).collect();
                panic!(
                    "timed out waiting for a completion on channel {:?}; pending: {:?}",
                    latest, kinds
                );
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl ChannelFactory for ChannelTester {
    fn create_channel(&self, context: AttemptContext, sink: CompletionSink) -> Box<dyn Channel> {
        let mut state = self.shared.lock();
        let id = state.next_channel_id;
        state.next_channel_id += 1;
        state.latest_channel = Some(id);
        state.tokens.push(context.token);

        tracing::trace!(channel = id, generation = context.generation, "Fake channel created");

        Box::new(FakeChannel {
            id,
            sink,
            shared: Arc::clone(&self.shared),
        })
    }
}

fn poll_cancelled(shared: Arc<TesterShared>) {
    loop {
        let ready: Vec<PendingCompletion> = {
            let mut state = shared.lock();
            loop {
                if state.shut_down {
                    return;
                }
                if state
                    .pending
                    .iter()
                    .any(|pending| state.cancelled.contains(&pending.channel_id))
                {
                    break;
                }
                state = shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            let TesterState {
                pending, cancelled, ..
            } = &mut *state;
            let (ready, rest): (VecDeque<_>, VecDeque<_>) = pending
                .drain(..)
                .partition(|pending| cancelled.contains(&pending.channel_id));
            *pending = rest;
            ready.into_iter().collect()
        };

        for pending in ready {
            if pending.kind == CompletionKind::Finish {
                pending.complete_with_status(Status::cancelled());
            } else {
                pending.complete(false);
            }
        }
    }
}

struct FakeChannel {
    id: u64,
    sink: CompletionSink,
    shared: Arc<TesterShared>,
}

impl FakeChannel {
    fn issue(&self, kind: CompletionKind) {
        self.shared.push(PendingCompletion {
            channel_id: self.id,
            kind,
            sink: self.sink.clone(),
            teardown: None,
        });
    }
}

impl Channel for FakeChannel {
    fn open(&mut self) {
        self.issue(CompletionKind::Open);
    }

    fn read(&mut self) {
        self.issue(CompletionKind::Read);
    }

    fn write(&mut self, message: Bytes) {
        self.shared.lock().written.push(message);
        self.issue(CompletionKind::Write);
    }

    fn finish(&mut self) {
        self.issue(CompletionKind::Finish);
    }

    fn finish_immediately(&mut self) -> Status {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            state.cancelled.insert(self.id);
            state.pending.push_back(PendingCompletion {
                channel_id: self.id,
                kind: CompletionKind::Finish,
                sink: self.sink.clone(),
                teardown: Some(tx),
            });
        }
        self.shared.changed.notify_all();

        rx.blocking_recv().unwrap_or_else(|_| Status::cancelled())
    }
}
