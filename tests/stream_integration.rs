//! Stream integration tests
//!
//! Drive the full stream lifecycle through the fake credentials provider and
//! the fake channel tester. Covers start/stop contracts, observer
//! notifications, writes, auth edge cases, idleness, backoff, error
//! classification, and token refresh.

use a3s_stream::{
    AsyncQueue, ChannelTester, Code, CompletionEndState, CompletionKind,
    FakeCredentialsProvider, Status, Stream, StreamConfig, StreamObserver, StreamState, TimerId,
    Token,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const IDLE_TIMER: TimerId = TimerId::ListenStreamIdle;
const BACKOFF_TIMER: TimerId = TimerId::ListenStreamConnectionBackoff;

struct RecordingObserver {
    tester: ChannelTester,
    states: Mutex<Vec<String>>,
    fail_next_read: AtomicBool,
}

impl RecordingObserver {
    fn new(tester: ChannelTester) -> Self {
        Self {
            tester,
            states: Mutex::new(Vec::new()),
            fail_next_read: AtomicBool::new(false),
        }
    }

    fn record(&self, state: String) {
        self.states.lock().unwrap().push(state);
    }
}

impl StreamObserver for RecordingObserver {
    fn on_open(&self) {
        self.record("NotifyStreamOpen".to_string());
    }

    fn on_response(&self, message: Bytes) -> Result<(), Status> {
        if message.is_empty() {
            self.record("NotifyStreamResponse".to_string());
        } else {
            self.record(format!(
                "NotifyStreamResponse({})",
                String::from_utf8_lossy(&message)
            ));
        }

        if self.fail_next_read.swap(false, Ordering::SeqCst) {
            // The stream tears the channel down synchronously
            self.tester.keep_polling();
            return Err(Status::new(Code::Internal, ""));
        }
        Ok(())
    }

    fn on_close(&self, status: Status) {
        self.record(format!("NotifyStreamClose({})", status.code()));
    }
}

struct Fixture {
    queue: Arc<AsyncQueue>,
    tester: ChannelTester,
    credentials: Arc<FakeCredentialsProvider>,
    observer: Arc<RecordingObserver>,
    stream: Stream,
}

impl Fixture {
    fn new() -> Self {
        let queue = AsyncQueue::new("stream-integration").unwrap();
        let tester = ChannelTester::new(Arc::clone(&queue));
        let credentials = Arc::new(FakeCredentialsProvider::new());
        let observer = Arc::new(RecordingObserver::new(tester.clone()));
        let stream = Stream::new(
            Arc::clone(&queue),
            credentials.clone(),
            Arc::new(tester.clone()),
            observer.clone(),
            StreamConfig::listen(),
        )
        .unwrap();

        Self {
            queue,
            tester,
            credentials,
            observer,
            stream,
        }
    }

    /// Run `f` against the stream on the worker queue
    fn run<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Stream) -> R + Send + 'static,
        R: Send + 'static,
    {
        let stream = self.stream.clone();
        self.queue.enqueue_blocking(move || f(&stream))
    }

    /// Start the stream and let the token request settle
    fn start_stream(&self) {
        self.run(|stream| stream.start()).unwrap();
        self.queue.enqueue_blocking(|| {});
    }

    /// Start the stream and acknowledge the channel open
    fn open_stream(&self) {
        self.start_stream();
        self.tester
            .force_finish([CompletionEndState::ok(CompletionKind::Open)]);
    }

    fn force_finish(&self, end_states: impl IntoIterator<Item = CompletionEndState>) {
        self.tester.force_finish(end_states);
    }

    fn observed_states(&self) -> Vec<String> {
        self.observer.states.lock().unwrap().clone()
    }

    fn last_state(&self) -> String {
        self.observed_states().last().cloned().unwrap_or_default()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let tester = self.tester.clone();
            self.run(move |stream| {
                if stream.is_started() {
                    tester.keep_polling();
                    stream.stop();
                }
            });
        }
        self.tester.shutdown();
        self.queue.shutdown();
    }
}

fn read_error_then(status: Code) -> Vec<CompletionEndState> {
    vec![
        CompletionEndState::error(CompletionKind::Read),
        CompletionEndState::finish(Status::new(status, "")),
    ]
}

// ─── Start ───────────────────────────────────────────────────────

#[test]
fn test_can_start() {
    let fx = Fixture::new();
    let (started_before, result, started, open) = fx.run(|stream| {
        let before = stream.is_started();
        let result = stream.start();
        (before, result, stream.is_started(), stream.is_open())
    });

    assert!(!started_before);
    assert!(result.is_ok());
    assert!(started);
    assert!(!open);
}

#[test]
fn test_can_restart() {
    let fx = Fixture::new();
    fx.tester.keep_polling();
    let (first, second) = fx.run(|stream| {
        let first = stream.start();
        stream.stop();
        (first, stream.start())
    });

    assert!(first.is_ok());
    assert!(second.is_ok());
}

#[test]
fn test_cannot_start_twice() {
    let fx = Fixture::new();
    let (first, second) = fx.run(|stream| (stream.start(), stream.start()));

    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert!(err.is_contract_violation());
    assert!(err.to_string().contains("already started"));
}

// ─── Stop ────────────────────────────────────────────────────────

#[test]
fn test_can_stop_before_starting() {
    let fx = Fixture::new();
    fx.run(|stream| stream.stop());
    assert!(fx.observed_states().is_empty());
}

#[test]
fn test_can_stop_after_starting() {
    let fx = Fixture::new();
    fx.tester.keep_polling();
    let (started, stopped) = fx.run(|stream| {
        stream.start().unwrap();
        let started = stream.is_started();
        stream.stop();
        (started, stream.is_started())
    });

    assert!(started);
    assert!(!stopped);
}

#[test]
fn test_can_stop_twice() {
    let fx = Fixture::new();
    fx.tester.keep_polling();
    fx.run(|stream| {
        stream.stop();
        stream.stop();

        stream.start().unwrap();
        stream.stop();
        stream.stop();
    });

    // Never opened, so never closed
    assert!(fx.observed_states().is_empty());
}

#[test]
fn test_stop_before_open_tears_down_channel() {
    let fx = Fixture::new();
    fx.start_stream();
    assert_eq!(fx.tester.pending_kinds(), vec![CompletionKind::Open]);

    fx.tester.keep_polling();
    fx.run(|stream| stream.stop());

    assert_eq!(fx.run(|stream| stream.state()), StreamState::Initial);
    assert!(fx.observed_states().is_empty());
}

// ─── Write ───────────────────────────────────────────────────────

#[test]
fn test_cannot_write_before_open() {
    let fx = Fixture::new();
    let (before_start, while_starting) = fx.run(|stream| {
        let before = stream.write(Bytes::new());
        stream.start().unwrap();
        (before, stream.write(Bytes::new()))
    });

    assert!(before_start.unwrap_err().is_contract_violation());
    assert!(while_starting.unwrap_err().is_contract_violation());
    assert!(fx.tester.written_messages().is_empty());
}

#[test]
fn test_several_writes() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.run(|stream| {
        stream.write(Bytes::new()).unwrap();
        stream.write(Bytes::new()).unwrap();
    });

    let mut writes = 0;
    fx.tester.force_finish_with(|completion| {
        match completion.kind() {
            CompletionKind::Read | CompletionKind::Write => {
                if completion.kind() == CompletionKind::Write {
                    writes += 1;
                }
                completion.complete(true);
            }
            other => panic!("unexpected completion {:?}", other),
        }
        writes == 2
    });

    assert_eq!(fx.tester.written_messages().len(), 2);
    assert!(fx.run(|stream| stream.is_open()));
}

#[test]
fn test_writes_reach_channel_in_order() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.run(|stream| {
        stream.write("first").unwrap();
        stream.write("second").unwrap();
    });

    assert_eq!(
        fx.tester.written_messages(),
        vec![Bytes::from("first"), Bytes::from("second")]
    );
}

// ─── Observer ────────────────────────────────────────────────────

#[test]
fn test_observer_receives_stream_open() {
    let fx = Fixture::new();
    fx.open_stream();

    let (started, open) = fx.run(|stream| (stream.is_started(), stream.is_open()));
    assert!(started);
    assert!(open);
    assert_eq!(fx.observed_states(), vec!["NotifyStreamOpen"]);
}

#[test]
fn test_observer_receives_stream_read() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.force_finish([
        CompletionEndState::read("foo"),
        CompletionEndState::read("bar"),
    ]);

    assert!(fx.run(|stream| stream.is_open()));
    assert_eq!(
        fx.observed_states(),
        vec![
            "NotifyStreamOpen",
            "NotifyStreamResponse(foo)",
            "NotifyStreamResponse(bar)"
        ]
    );
    // Exactly one read stays outstanding
    assert_eq!(fx.tester.pending_kinds(), vec![CompletionKind::Read]);
}

#[test]
fn test_observer_receives_stream_close() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.tester.keep_polling();
    let (started, open) = fx.run(|stream| {
        stream.stop();
        (stream.is_started(), stream.is_open())
    });

    assert!(!started);
    assert!(!open);
    assert_eq!(
        fx.observed_states(),
        vec!["NotifyStreamOpen", "NotifyStreamClose(Ok)"]
    );
}

#[test]
fn test_observer_receives_stream_close_on_error() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.force_finish(read_error_then(Code::Unavailable));

    let (started, open) = fx.run(|stream| (stream.is_started(), stream.is_open()));
    assert!(!started);
    assert!(!open);
    assert_eq!(
        fx.observed_states(),
        vec!["NotifyStreamOpen", "NotifyStreamClose(Unavailable)"]
    );
}

#[test]
fn test_no_callbacks_after_stop() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.tester.keep_polling();
    fx.run(|stream| stream.stop());

    // Let the poller fail the abandoned read, then drain the queue
    std::thread::sleep(std::time::Duration::from_millis(50));
    fx.queue.enqueue_blocking(|| {});

    assert_eq!(
        fx.observed_states(),
        vec!["NotifyStreamOpen", "NotifyStreamClose(Ok)"]
    );
}

#[test]
fn test_superseded_channel_completions_ignored_after_restart() {
    let fx = Fixture::new();
    fx.open_stream();
    let first_channel = fx.tester.latest_channel_id().unwrap();
    fx.run(|stream| stream.write("pending")).unwrap();

    // A failed write finishes the call while the read is still outstanding
    fx.force_finish([
        CompletionEndState::error(CompletionKind::Write),
        CompletionEndState::finish(Status::new(Code::Unavailable, "")),
    ]);
    fx.run(|stream| stream.inhibit_backoff());
    fx.open_stream();
    assert_ne!(fx.tester.latest_channel_id(), Some(first_channel));

    // The old channel's read now delivers a message
    fx.tester
        .force_finish_channel(first_channel, [CompletionEndState::read("stale")]);

    assert!(fx.run(|stream| stream.is_open()));
    assert_eq!(
        fx.observed_states(),
        vec![
            "NotifyStreamOpen",
            "NotifyStreamClose(Unavailable)",
            "NotifyStreamOpen"
        ]
    );
    assert_eq!(fx.tester.pending_kinds(), vec![CompletionKind::Read]);
}

#[test]
fn test_torn_down_channel_ignored_after_restart() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.tester.keep_polling();
    fx.run(|stream| stream.stop());
    fx.open_stream();

    // Give the poller time to fail the first channel's abandoned read
    std::thread::sleep(std::time::Duration::from_millis(50));
    fx.queue.enqueue_blocking(|| {});

    assert!(fx.run(|stream| stream.is_open()));
    assert_eq!(
        fx.observed_states(),
        vec![
            "NotifyStreamOpen",
            "NotifyStreamClose(Ok)",
            "NotifyStreamOpen"
        ]
    );
    assert_eq!(fx.tester.pending_kinds(), vec![CompletionKind::Read]);
}

// ─── Auth ────────────────────────────────────────────────────────

#[test]
fn test_channel_bound_to_fetched_token() {
    let fx = Fixture::new();
    fx.open_stream();

    assert_eq!(
        fx.tester.channel_tokens(),
        vec![Token::new("fake-token", "fake-user")]
    );
    assert_eq!(fx.credentials.observed_states(), vec!["GetToken"]);
}

#[test]
fn test_auth_failure_on_start() {
    let fx = Fixture::new();
    fx.credentials.fail_get_token();
    fx.run(|stream| stream.start()).unwrap();

    let (started, open) = fx.run(|stream| (stream.is_started(), stream.is_open()));
    assert!(!started);
    assert!(!open);
    assert_eq!(fx.observed_states(), vec!["NotifyStreamClose(Unknown)"]);
    assert_eq!(fx.tester.channel_count(), 0);
    assert!(!fx.queue.is_scheduled(BACKOFF_TIMER));
}

#[test]
fn test_delayed_token_opens_stream() {
    let fx = Fixture::new();
    fx.credentials.delay_get_token();
    fx.run(|stream| stream.start()).unwrap();
    assert_eq!(fx.tester.channel_count(), 0);

    fx.credentials.invoke_get_token();
    fx.tester
        .force_finish([CompletionEndState::ok(CompletionKind::Open)]);

    assert!(fx.run(|stream| stream.is_open()));
    assert_eq!(fx.tester.channel_count(), 1);
}

#[test]
fn test_auth_when_stream_has_been_stopped() {
    let fx = Fixture::new();
    fx.credentials.delay_get_token();

    fx.run(|stream| {
        stream.start().unwrap();
        stream.stop();
    });

    fx.credentials.invoke_get_token();
    fx.queue.enqueue_blocking(|| {});
    assert_eq!(fx.tester.channel_count(), 0);
    assert!(fx.observed_states().is_empty());
}

#[test]
fn test_auth_outlives_stream() {
    let queue = AsyncQueue::new("stream-integration").unwrap();
    let tester = ChannelTester::new(Arc::clone(&queue));
    let credentials = Arc::new(FakeCredentialsProvider::new());
    let observer = Arc::new(RecordingObserver::new(tester.clone()));
    credentials.delay_get_token();

    let stream = Stream::new(
        Arc::clone(&queue),
        credentials.clone(),
        Arc::new(tester.clone()),
        observer.clone(),
        StreamConfig::listen(),
    )
    .unwrap();

    queue.enqueue_blocking(move || {
        stream.start().unwrap();
        stream.stop();
        drop(stream);
    });

    credentials.invoke_get_token();
    queue.enqueue_blocking(|| {});

    assert_eq!(tester.channel_count(), 0);
    assert!(observer.states.lock().unwrap().is_empty());
    tester.shutdown();
    queue.shutdown();
}

// ─── Idleness ────────────────────────────────────────────────────

#[test]
fn test_closes_on_idle() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.run(|stream| stream.mark_idle());
    assert!(fx.queue.is_scheduled(IDLE_TIMER));

    fx.tester.keep_polling();
    fx.queue.run_scheduled_operations_until(IDLE_TIMER);

    let (started, open) = fx.run(|stream| (stream.is_started(), stream.is_open()));
    assert!(!started);
    assert!(!open);
    assert_eq!(fx.last_state(), "NotifyStreamClose(Ok)");
}

#[test]
fn test_mark_idle_schedules_once() {
    let fx = Fixture::new();
    fx.run(|stream| stream.mark_idle());
    assert!(!fx.queue.is_scheduled(IDLE_TIMER));

    fx.open_stream();
    fx.run(|stream| {
        stream.mark_idle();
        stream.mark_idle();
    });
    assert!(fx.queue.is_scheduled(IDLE_TIMER));
}

#[test]
fn test_cancel_idle_check() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.run(|stream| stream.mark_idle());
    assert!(fx.queue.is_scheduled(IDLE_TIMER));

    fx.run(|stream| stream.cancel_idle_check());
    assert!(!fx.queue.is_scheduled(IDLE_TIMER));
}

#[test]
fn test_write_cancels_idle() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.run(|stream| stream.mark_idle());
    assert!(fx.queue.is_scheduled(IDLE_TIMER));

    fx.run(|stream| stream.write(Bytes::new())).unwrap();
    assert!(!fx.queue.is_scheduled(IDLE_TIMER));
}

// ─── Backoff ─────────────────────────────────────────────────────

#[test]
fn test_backoff() {
    let fx = Fixture::new();
    fx.open_stream();
    assert!(!fx.queue.is_scheduled(BACKOFF_TIMER));

    // Resource exhaustion jumps to the max delay, so the timer cannot elapse
    // between the checks below
    fx.force_finish(read_error_then(Code::ResourceExhausted));
    assert!(!fx.queue.is_scheduled(BACKOFF_TIMER));

    fx.start_stream();
    assert!(fx.queue.is_scheduled(BACKOFF_TIMER));
    assert_eq!(fx.run(|stream| stream.state()), StreamState::Backoff);
    assert!(!fx.run(|stream| stream.is_open()));

    fx.queue.run_scheduled_operations_until(BACKOFF_TIMER);
    fx.tester
        .force_finish([CompletionEndState::ok(CompletionKind::Open)]);
    assert!(fx.run(|stream| stream.is_open()));

    fx.force_finish(read_error_then(Code::ResourceExhausted));
    fx.run(|stream| stream.inhibit_backoff());
    fx.start_stream();
    assert!(!fx.queue.is_scheduled(BACKOFF_TIMER));
}

#[test]
fn test_stop_cancels_backoff() {
    let fx = Fixture::new();
    fx.open_stream();
    fx.force_finish(read_error_then(Code::ResourceExhausted));

    fx.start_stream();
    assert!(fx.queue.is_scheduled(BACKOFF_TIMER));

    fx.run(|stream| stream.stop());
    assert!(!fx.queue.is_scheduled(BACKOFF_TIMER));
    assert!(!fx.run(|stream| stream.is_started()));
}

// ─── Errors ──────────────────────────────────────────────────────

#[test]
fn test_error_on_write() {
    let fx = Fixture::new();
    fx.open_stream();
    fx.run(|stream| stream.write(Bytes::new())).unwrap();

    let mut failed_write = false;
    fx.tester.force_finish_with(|completion| match completion.kind() {
        CompletionKind::Read => {
            // Once the write failed, fail the read too
            completion.complete(!failed_write);
            false
        }
        CompletionKind::Write => {
            failed_write = true;
            completion.complete(false);
            false
        }
        CompletionKind::Finish => {
            assert!(failed_write);
            completion.complete_with_status(Status::new(Code::Unauthenticated, ""));
            true
        }
        other => panic!("unexpected completion {:?}", other),
    });

    let (started, open) = fx.run(|stream| (stream.is_started(), stream.is_open()));
    assert!(!started);
    assert!(!open);
    assert_eq!(fx.last_state(), "NotifyStreamClose(Unauthenticated)");
}

#[test]
fn test_client_side_error_on_read() {
    let fx = Fixture::new();
    fx.open_stream();

    fx.observer.fail_next_read.store(true, Ordering::SeqCst);
    fx.force_finish([CompletionEndState::ok(CompletionKind::Read)]);

    let (started, open) = fx.run(|stream| (stream.is_started(), stream.is_open()));
    assert!(!started);
    assert!(!open);
    assert_eq!(fx.last_state(), "NotifyStreamClose(Internal)");
}

#[test]
fn test_refreshes_token_upon_expiration() {
    let fx = Fixture::new();
    fx.open_stream();
    fx.force_finish(read_error_then(Code::Unauthenticated));

    // Unauthenticated invalidates the token
    assert_eq!(
        fx.credentials.observed_states(),
        vec!["GetToken", "InvalidateToken"]
    );

    fx.run(|stream| stream.inhibit_backoff());
    fx.open_stream();
    fx.force_finish(read_error_then(Code::Unavailable));

    // Any other error leaves the token alone
    assert_eq!(
        fx.credentials.observed_states(),
        vec!["GetToken", "InvalidateToken", "GetToken"]
    );
    assert_eq!(fx.tester.channel_count(), 2);
}
