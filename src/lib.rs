//! # a3s-stream
//!
//! Restartable, authenticated bidirectional stream controller for the A3S
//! ecosystem.
//!
//! ## Overview
//!
//! `a3s-stream` drives one long-lived streaming RPC on top of a pluggable
//! transport. It fetches a token before every attempt, keeps a single read
//! outstanding while open, classifies failures into one close notification,
//! backs off between failed attempts, and retires idle streams. Transport
//! framing and retry policy live outside this crate.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_stream::{AsyncQueue, Stream, StreamConfig};
//! use std::sync::Arc;
//!
//! let queue = AsyncQueue::new("listen-queue")?;
//! let stream = Stream::new(
//!     Arc::clone(&queue),
//!     credentials,     // Arc<dyn CredentialsProvider>
//!     channel_factory, // Arc<dyn ChannelFactory>
//!     observer,        // Arc<dyn StreamObserver>
//!     StreamConfig::listen(),
//! )?;
//!
//! let s = stream.clone();
//! queue.enqueue_blocking(move || s.start())?;
//! ```
//!
//! ## Architecture
//!
//! - **AsyncQueue**: serialized worker queue with named timers; owns all state
//! - **Stream**: lifecycle state machine, talks to everything below
//! - **BackoffController** / **IdleTimer**: timers scheduled on the queue
//! - **CredentialsProvider** trait: asynchronous token source
//! - **ChannelFactory** / **Channel** traits: transport boundary
//! - **StreamObserver** trait: open / response / close notifications

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod error;
pub mod idle;
pub mod queue;
pub mod status;
pub mod stream;
pub mod transport;

// Re-export core types
pub use backoff::BackoffController;
pub use config::{BackoffConfig, StreamConfig};
pub use credentials::{CredentialsProvider, Token};
pub use error::{Result, StreamError};
pub use idle::IdleTimer;
pub use queue::{AsyncQueue, DelayedOperation, Operation, TimerId};
pub use status::{Code, Status};
pub use stream::{Stream, StreamObserver, StreamState};
pub use transport::{
    AttemptContext, Channel, ChannelFactory, Completion, CompletionKind, CompletionSink,
};

// Re-export bundled providers for convenience
pub use credentials::empty::EmptyCredentialsProvider;
pub use credentials::fake::FakeCredentialsProvider;
pub use transport::tester::{ChannelTester, CompletionEndState, PendingCompletion};
