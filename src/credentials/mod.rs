//! Credentials provider trait, the token source behind every stream attempt
//!
//! A stream requests a token at the start of each attempt and binds the
//! channel it creates to that token. Providers resolve asynchronously and may
//! resolve long after the requesting stream has stopped or been dropped; the
//! stream guards against that, so providers need no knowledge of who asked.

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

pub mod empty;
pub mod fake;

/// Asynchronous source of auth tokens
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Fetch the current token, refreshing it if it was invalidated
    async fn get_token(&self) -> Result<Token>;

    /// Mark the cached token as stale so the next `get_token` refreshes it
    fn invalidate_token(&self);
}

/// Opaque credential attached to a channel
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Token {
    value: Option<String>,
    user_id: Option<String>,
}

impl Token {
    /// Create a token for the given user
    pub fn new(value: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            user_id: Some(user_id.into()),
        }
    }

    /// A token carrying no credential (unauthenticated access)
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    /// Raw token value, if any
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// User the token was issued for, if any
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.value.is_some()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &self.value.as_ref().map(|_| "<redacted>"))
            .field("user_id", &self.user_id)
            .finish()
    }
}
