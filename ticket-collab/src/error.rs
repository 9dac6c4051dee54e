//! Error taxonomy for the comment sync engine.
//!
//! Every failure mode has a degraded-but-functional outcome:
//!
//! | Error | Outcome |
//! |-------|---------|
//! | [`TransportError`] | retried with backoff, then `Offline` |
//! | [`StoreError`] | queued as a pending write, retried by the flush loop |
//! | [`ValidationError`] | rejected before any CRDT mutation |
//! | [`CacheError`] | logged, never blocks the in-memory merge |
//! | [`DocError`] | remote input dropped, local input rejected |

use thiserror::Error;

/// Peer transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Rendezvous unreachable")]
    Unreachable,
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Canonical store failures (the durable system of record).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Canonical store unreachable")]
    Unreachable,
    #[error("Canonical store rejected write: {0}")]
    Rejected(String),
    #[error("Canonical store I/O error: {0}")]
    Io(String),
}

/// Synchronous input validation failures at the facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Comment content is empty")]
    EmptyContent,
    #[error("Comment content exceeds {max} characters ({len})")]
    ContentTooLong { len: usize, max: usize },
    #[error("Comment author is missing")]
    MissingAuthor,
}

/// Local durable cache failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Cache unavailable")]
    Unavailable,
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Database(e.to_string())
    }
}

/// Replicated document failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("Failed to decode update: {0}")]
    Decode(String),
    #[error("Failed to encode comment: {0}")]
    Encode(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

impl From<yrs::encoding::read::Error> for DocError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocError::Decode(e.to_string())
    }
}

/// Errors returned to consumers of [`crate::CommentThread`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Document(#[from] DocError),
    #[error("Room session has been torn down")]
    SessionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::ConnectFailed("refused".into()).to_string(),
            "Connect failed: refused"
        );
        assert_eq!(StoreError::Unreachable.to_string(), "Canonical store unreachable");
        assert_eq!(
            ValidationError::ContentTooLong { len: 12, max: 10 }.to_string(),
            "Comment content exceeds 10 characters (12)"
        );
        assert_eq!(CacheError::Unavailable.to_string(), "Cache unavailable");
    }

    #[test]
    fn test_collab_error_wraps_validation() {
        let err: CollabError = ValidationError::EmptyContent.into();
        assert_eq!(err.to_string(), "Comment content is empty");
        assert!(matches!(err, CollabError::Validation(ValidationError::EmptyContent)));
    }
}
