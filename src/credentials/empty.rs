//! Credentials provider for backends that need no authentication

use super::{CredentialsProvider, Token};
use crate::error::Result;
use async_trait::async_trait;

/// Always resolves an unauthenticated token
#[derive(Debug, Default, Clone)]
pub struct EmptyCredentialsProvider;

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> Result<Token> {
        Ok(Token::unauthenticated())
    }

    fn invalidate_token(&self) {}
}
