//! OAuth2 authentication against the EGA AAI.
//!
//! The download engine only depends on the [`TokenProvider`] trait: a
//! thread-safe source of bearer tokens, queried at request-build time so
//! a retried request never reuses a stale token. [`AuthManager`] is the
//! production implementation (password + refresh grants with lazy
//! refresh); [`StaticTokenProvider`] serves tests and pre-issued tokens.

mod credentials;
mod manager;

pub use credentials::Credentials;
pub use manager::AuthManager;

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// A thread-safe source of valid access tokens.
///
/// Implementations refresh transparently; callers just ask for a token
/// per outbound request.
pub trait TokenProvider: Send + Sync + 'static {
    /// Return a currently valid access token.
    fn access_token(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;
}

/// A token provider that always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a pre-issued token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        let token = self.token.clone();
        Box::pin(async move { Ok(token) })
    }
}
