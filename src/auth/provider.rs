//! Sources of broker credentials, queried once per connection attempt.

use std::time::Duration;

use crate::error::AuthError;

use super::TokenIssuer;

pub trait CredentialProvider: Send + Sync {
    /// Token for the next connection attempt.
    fn next_token(&self) -> Result<String, AuthError>;

    /// Whether a rejected token can be replaced by a fresh one. A non-renewable
    /// provider would hand out the same rejected token again.
    fn is_renewable(&self) -> bool;
}

/// A token handed to the relay from outside (e.g. issued by an auth service).
#[derive(Debug, Clone)]
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CredentialProvider for StaticCredential {
    fn next_token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }

    fn is_renewable(&self) -> bool {
        false
    }
}

/// Mints a fresh short-lived token for every attempt.
#[derive(Debug, Clone)]
pub struct IssuingCredential {
    issuer: TokenIssuer,
    subject: String,
    ttl: Duration,
}

impl IssuingCredential {
    pub fn new(issuer: TokenIssuer, subject: impl Into<String>, ttl: Duration) -> Self {
        Self {
            issuer,
            subject: subject.into(),
            ttl,
        }
    }
}

impl CredentialProvider for IssuingCredential {
    fn next_token(&self) -> Result<String, AuthError> {
        Ok(self.issuer.issue(&self.subject, self.ttl)?.token)
    }

    fn is_renewable(&self) -> bool {
        true
    }
}
