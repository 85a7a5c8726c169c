//! Error taxonomy shared by the relay components.
//!
//! Transport errors are recovered inside the connection kernel. Validation and
//! persistence errors are surfaced synchronously to the caller of the operation
//! that produced them. Credential errors are never retried with the same token.

use thiserror::Error;

/// Credential rejected while resolving a bearer token to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Token expiry lies in the past (unix seconds)
    #[error("credential expired at {0}")]
    ExpiredCredential(i64),

    /// Token could not be parsed or its signature did not verify
    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    /// Token id is on the revocation list
    #[error("credential {0} has been revoked")]
    RevokedCredential(String),

    /// Broker refused the credential during the handshake
    #[error("broker rejected credential: {0}")]
    Rejected(String),
}

/// Malformed topic or payload. Always the caller's bug, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("topic '{0}' starts or ends with a delimiter")]
    DelimiterEdge(String),

    #[error("topic '{0}' contains an empty segment")]
    EmptySegment(String),

    #[error("wildcards are not allowed in publish topic '{0}'")]
    WildcardNotAllowed(String),

    #[error("wildcard in '{0}' must occupy a whole segment ('#' only as the last one)")]
    MisplacedWildcard(String),

    #[error("topic is {len} bytes, broker maximum is {max}")]
    TopicTooLong { len: usize, max: usize },

    #[error("topic '{0}' contains a NUL character")]
    InvalidCharacter(String),

    #[error("payload is {len} bytes, broker maximum is {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("'{0}' is not a valid user id for notification topics")]
    InvalidUserId(String),
}

/// Network or broker level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(String),

    #[error("network timeout")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("connection refused by broker: {0}")]
    Refused(String),

    #[error("broker refused credentials: {0}")]
    NotAuthorized(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client request failed: {0}")]
    Client(String),
}

impl TransportError {
    /// Broker-side credential refusal, handled as an [`AuthError`] by the kernel.
    pub fn is_auth_refusal(&self) -> bool {
        matches!(self, TransportError::NotAuthorized(_))
    }
}

/// Storage failure or a rejected status transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),

    #[error("no log entry with id {0}")]
    UnknownLog(i64),

    #[error("status transition {from} -> {to} is not allowed")]
    InvalidTransition { from: String, to: String },

    #[error("message {0} is already logged")]
    Duplicate(String),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("persistence worker unavailable: {0}")]
    WorkerUnavailable(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

/// Failure of a single `publish` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Write-before-send failed; the message never reached the transport
    #[error("message log unavailable: {0}")]
    LogUnavailable(#[from] PersistenceError),

    #[error("reconnect buffer is full ({capacity} messages)")]
    BufferExhausted { capacity: usize },

    /// Still buffered when the shutdown grace period ran out
    #[error("publish cancelled by shutdown")]
    Cancelled,

    #[error("relay is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("relay is shutting down")]
    ShuttingDown,
}

/// Startup failures of the relay as a whole.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_errors_convert_into_log_unavailable() {
        let err: PublishError = PersistenceError::Database("disk full".into()).into();
        assert_eq!(
            err,
            PublishError::LogUnavailable(PersistenceError::Database("disk full".into()))
        );
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn only_credential_refusals_count_as_auth() {
        assert!(TransportError::NotAuthorized("BadUserNamePassword".into()).is_auth_refusal());
        assert!(!TransportError::Refused("ServiceUnavailable".into()).is_auth_refusal());
        assert!(!TransportError::Timeout.is_auth_refusal());
    }
}
