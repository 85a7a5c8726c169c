//! Credential verification.
//!
//! The relay authenticates its broker session with short-lived bearer tokens that
//! resolve to an opaque [`Identity`]. The mapping from token to identity is behind
//! the [`CredentialVerifier`] trait; the bundled implementation checks
//! HMAC-SHA256 signed tokens of the form
//!
//! ```text
//! <subject>.<token_id>.<expiry_unix>.<hex(hmac_sha256(secret, "<subject>.<token_id>.<expiry_unix>"))>
//! ```
//!
//! Every rejection is written to the `realtimemq::audit` tracing target.

pub mod provider;

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AuthError;

pub use provider::{CredentialProvider, IssuingCredential, StaticCredential};

type HmacSha256 = Hmac<Sha256>;

pub const AUDIT_TARGET: &str = "realtimemq::audit";

const TOKEN_SEPARATOR: char = '.';

/// Resolved identity of a token holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    subject: String,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subject)
    }
}

/// An issued bearer token. Never persisted by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub subject: String,
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

pub trait CredentialVerifier: Send + Sync {
    /// Pure validation; the caller must not retry with the same token on error.
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

fn sign(secret: &[u8], claims: &str) -> Result<Vec<u8>, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AuthError::MalformedCredential(format!("invalid signing key: {e}")))?;
    mac.update(claims.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn check_subject(subject: &str) -> Result<(), AuthError> {
    if subject.is_empty() || subject.contains(TOKEN_SEPARATOR) {
        return Err(AuthError::MalformedCredential(format!(
            "subject '{subject}' must be non-empty and free of '{TOKEN_SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Mints signed tokens with the shared secret.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<Credential, AuthError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AuthError::MalformedCredential(format!("invalid ttl: {e}")))?;
        self.issue_expiring_at(subject, Utc::now() + ttl)
    }

    pub fn issue_expiring_at(
        &self,
        subject: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Credential, AuthError> {
        check_subject(subject)?;
        let token_id = Uuid::new_v4().simple().to_string();
        let claims = format!(
            "{subject}{TOKEN_SEPARATOR}{token_id}{TOKEN_SEPARATOR}{}",
            expires_at.timestamp()
        );
        let signature = hex::encode(sign(&self.secret, &claims)?);

        Ok(Credential {
            token: format!("{claims}{TOKEN_SEPARATOR}{signature}"),
            subject: subject.to_string(),
            token_id,
            expires_at,
        })
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer").field("secret", &"***").finish()
    }
}

/// Verifies tokens minted by [`TokenIssuer`] against a shared secret and a
/// revocation list of token ids.
#[derive(Clone)]
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
    revoked: HashSet<String>,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            revoked: HashSet::new(),
        }
    }

    pub fn with_revoked<I, S>(mut self, token_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.revoked.extend(token_ids.into_iter().map(Into::into));
        self
    }

    /// Verification against an explicit clock.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Identity, AuthError> {
        let parts: Vec<&str> = token.split(TOKEN_SEPARATOR).collect();
        let [subject, token_id, expiry, signature] = parts.as_slice() else {
            return Err(AuthError::MalformedCredential(format!(
                "expected 4 token segments, found {}",
                parts.len()
            )));
        };
        check_subject(subject)?;

        let expiry: i64 = expiry
            .parse()
            .map_err(|_| AuthError::MalformedCredential("expiry is not a unix timestamp".into()))?;
        let provided = hex::decode(signature)
            .map_err(|_| AuthError::MalformedCredential("signature is not hex encoded".into()))?;

        // Claims are only trusted once the signature checks out.
        let claims = format!("{subject}{TOKEN_SEPARATOR}{token_id}{TOKEN_SEPARATOR}{expiry}");
        let expected = sign(&self.secret, &claims)?;
        let signature_ok: bool = expected.ct_eq(provided.as_slice()).into();
        if !signature_ok {
            return Err(AuthError::MalformedCredential(
                "signature does not match".into(),
            ));
        }

        if self.revoked.contains(*token_id) {
            return Err(AuthError::RevokedCredential(token_id.to_string()));
        }
        if expiry <= now.timestamp() {
            return Err(AuthError::ExpiredCredential(expiry));
        }

        debug!("Verified credential {} for subject {}", token_id, subject);
        Ok(Identity::new(*subject))
    }
}

impl CredentialVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let result = self.verify_at(token, Utc::now());
        if let Err(e) = &result {
            warn!(target: AUDIT_TARGET, "Rejected credential: {}", e);
        }
        result
    }
}

impl fmt::Debug for HmacTokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacTokenVerifier")
            .field("secret", &"***")
            .field("revoked", &self.revoked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn issued_token_resolves_to_subject() {
        let issuer = TokenIssuer::new(SECRET);
        let credential = issuer.issue("relay-1", Duration::from_secs(60)).unwrap();
        let identity = HmacTokenVerifier::new(SECRET)
            .verify(&credential.token)
            .unwrap();
        assert_eq!(identity.subject(), "relay-1");
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = TokenIssuer::new(SECRET);
        let past = Utc::now() - chrono::Duration::seconds(5);
        let credential = issuer.issue_expiring_at("relay-1", past).unwrap();
        assert_eq!(
            HmacTokenVerifier::new(SECRET).verify(&credential.token),
            Err(AuthError::ExpiredCredential(past.timestamp()))
        );
    }

    #[test]
    fn expiry_is_checked_against_the_given_clock() {
        let issuer = TokenIssuer::new(SECRET);
        let expires = Utc::now() + chrono::Duration::seconds(30);
        let credential = issuer.issue_expiring_at("relay-1", expires).unwrap();
        let verifier = HmacTokenVerifier::new(SECRET);

        assert!(verifier.verify_at(&credential.token, expires - chrono::Duration::seconds(1)).is_ok());
        assert!(matches!(
            verifier.verify_at(&credential.token, expires),
            Err(AuthError::ExpiredCredential(_))
        ));
    }

    #[test]
    fn revoked_token_is_rejected() {
        let issuer = TokenIssuer::new(SECRET);
        let credential = issuer.issue("relay-1", Duration::from_secs(60)).unwrap();
        let verifier = HmacTokenVerifier::new(SECRET).with_revoked([credential.token_id.clone()]);
        assert_eq!(
            verifier.verify(&credential.token),
            Err(AuthError::RevokedCredential(credential.token_id))
        );
    }

    #[test]
    fn tampered_or_foreign_tokens_are_malformed() {
        let issuer = TokenIssuer::new(SECRET);
        let credential = issuer.issue("relay-1", Duration::from_secs(60)).unwrap();
        let verifier = HmacTokenVerifier::new(SECRET);

        let tampered = credential.token.replacen("relay-1", "admin", 1);
        assert!(matches!(
            verifier.verify(&tampered),
            Err(AuthError::MalformedCredential(_))
        ));

        let foreign = TokenIssuer::new(b"other".to_vec())
            .issue("relay-1", Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            verifier.verify(&foreign.token),
            Err(AuthError::MalformedCredential(_))
        ));

        for garbage in ["", "a.b", "a.b.c.d.e", "relay.id.soon.abcd", "relay.id.123.zz"] {
            assert!(
                matches!(verifier.verify(garbage), Err(AuthError::MalformedCredential(_))),
                "{garbage} should be malformed"
            );
        }
    }

    #[test]
    fn subjects_with_separators_cannot_be_issued() {
        let issuer = TokenIssuer::new(SECRET);
        assert!(matches!(
            issuer.issue("a.b", Duration::from_secs(1)),
            Err(AuthError::MalformedCredential(_))
        ));
    }
}
