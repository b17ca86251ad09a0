//! Scriptable credentials provider for tests
//!
//! Records every call it receives and can be told to fail or to hold the
//! next token request until the test releases it.

use super::{CredentialsProvider, Token};
use crate::error::{Result, StreamError};
use async_trait::async_trait;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

const REQUEST_WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct FakeState {
    observed: Vec<String>,
    fail_next: bool,
    delay_next: bool,
    delayed: Option<oneshot::Sender<()>>,
}

/// In-memory credentials provider for testing
pub struct FakeCredentialsProvider {
    token: Token,
    state: Mutex<FakeState>,
    request_registered: Condvar,
}

impl FakeCredentialsProvider {
    /// Create a provider resolving a fixed test token
    pub fn new() -> Self {
        Self::with_token(Token::new("fake-token", "fake-user"))
    }

    /// Create a provider resolving the given token
    pub fn with_token(token: Token) -> Self {
        Self {
            token,
            state: Mutex::new(FakeState::default()),
            request_registered: Condvar::new(),
        }
    }

    /// Calls received so far: "GetToken" and "InvalidateToken", in order
    pub fn observed_states(&self) -> Vec<String> {
        self.lock().observed.clone()
    }

    /// Make the next token request fail
    pub fn fail_get_token(&self) {
        self.lock().fail_next = true;
    }

    /// Hold the next token request until `invoke_get_token` is called
    pub fn delay_get_token(&self) {
        self.lock().delay_next = true;
    }

    /// Release a request held by `delay_get_token`
    ///
    /// # Panics
    ///
    /// Panics if no delayed request arrives within a few seconds.
    pub fn invoke_get_token(&self) {
        let state = self.lock();
        let (mut state, _) = self
            .request_registered
            .wait_timeout_while(state, REQUEST_WAIT, |state| state.delayed.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        let delayed = state
            .delayed
            .take()
            .unwrap_or_else(|| panic!("no delayed token request to invoke"));
        drop(state);

        // The requester may already be gone
        let _ = delayed.send(());
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FakeCredentialsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialsProvider for FakeCredentialsProvider {
    async fn get_token(&self) -> Result<Token> {
        let (delayed, fail) = {
            let mut state = self.lock();
            state.observed.push("GetToken".to_string());
            let fail = std::mem::take(&mut state.fail_next);
            let delayed = if std::mem::take(&mut state.delay_next) {
                let (tx, rx) = oneshot::channel();
                state.delayed = Some(tx);
                self.request_registered.notify_all();
                Some(rx)
            } else {
                None
            };
            (delayed, fail)
        };

        if let Some(rx) = delayed {
            let _ = rx.await;
        }

        if fail {
            Err(StreamError::Auth("Failed to get token".to_string()))
        } else {
            Ok(self.token.clone())
        }
    }

    fn invalidate_token(&self) {
        self.lock().observed.push("InvalidateToken".to_string());
    }
}
