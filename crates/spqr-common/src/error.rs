//! Error types for SPQR services

use std::fmt;
use tonic::Status;

/// Result type alias using SpqrError
pub type Result<T> = std::result::Result<T, SpqrError>;

/// Main error type for SPQR services
#[derive(Debug, thiserror::Error)]
pub enum SpqrError {
    /// Malformed or unexpected wire protocol data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// TLS required by policy but refused by the peer
    #[error("SSL connection required")]
    SslRequired,

    /// No frontend/backend rule for the (user, database) pair
    #[error("No route for user {user} database {database}")]
    UnknownRoute { user: String, database: String },

    /// Statement carries no routable predicate
    #[error("No route for statement: {0}")]
    NoRouteForStatement(String),

    /// Routing decision would pick a locked key range
    #[error("Key range {0} is locked")]
    RangeLocked(String),

    /// Lock requested on an already-locked key range
    #[error("Key range {0} is already locked")]
    AlreadyLocked(String),

    /// Unlock requested on an unlocked key range
    #[error("Key range {0} is not locked")]
    NotLocked(String),

    /// Split bound outside the target range
    #[error("Bad split bound for key range {0}")]
    BadBound(String),

    /// Merge bound does not separate two adjacent ranges
    #[error("No adjacent key ranges at bound")]
    NotAdjacent,

    /// Merge candidates are owned by different shards
    #[error("Key ranges belong to different shards: {0} vs {1}")]
    ShardMismatch(String, String),

    /// Shard cannot be reached or is unknown
    #[error("Shard unavailable: {0}")]
    ShardUnavailable(String),

    /// Backend connection pool at capacity
    #[error("Connection pool exhausted for shard {0}")]
    PoolExhausted(String),

    /// Deadline exceeded on an external call
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Durable KV store unreachable
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpqrError {
    /// Create an internal error from any displayable error
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        SpqrError::Internal(err.to_string())
    }

    /// SQLSTATE code reported to PostgreSQL clients for this error
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SpqrError::Protocol(_) => "08P01",
            SpqrError::AuthFailed(_) => "28P01",
            SpqrError::SslRequired => "28000",
            SpqrError::UnknownRoute { .. } => "28P01",
            SpqrError::NoRouteForStatement(_) => "42P01",
            SpqrError::RangeLocked(_) => "55P03",
            SpqrError::AlreadyLocked(_) => "55006",
            SpqrError::NotLocked(_) => "55000",
            SpqrError::BadBound(_) => "22023",
            SpqrError::NotAdjacent => "22023",
            SpqrError::ShardMismatch(_, _) => "55000",
            SpqrError::ShardUnavailable(_) => "08001",
            SpqrError::PoolExhausted(_) => "53300",
            SpqrError::Timeout(_) => "57014",
            SpqrError::StorageUnavailable(_) => "58000",
            SpqrError::Internal(_) => "XX000",
        }
    }

    /// True if the session that hit this error can keep serving queries
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SpqrError::Protocol(_) | SpqrError::AuthFailed(_) | SpqrError::SslRequired
        )
    }
}

/// Convert SpqrError to gRPC Status for coordinator responses
impl From<SpqrError> for Status {
    fn from(err: SpqrError) -> Self {
        let code = match &err {
            SpqrError::Protocol(_) => tonic::Code::InvalidArgument,
            SpqrError::AuthFailed(_) => tonic::Code::Unauthenticated,
            SpqrError::SslRequired => tonic::Code::Unauthenticated,
            SpqrError::UnknownRoute { .. } => tonic::Code::NotFound,
            SpqrError::NoRouteForStatement(_) => tonic::Code::FailedPrecondition,
            SpqrError::RangeLocked(_) => tonic::Code::FailedPrecondition,
            SpqrError::AlreadyLocked(_) => tonic::Code::FailedPrecondition,
            SpqrError::NotLocked(_) => tonic::Code::FailedPrecondition,
            SpqrError::BadBound(_) => tonic::Code::InvalidArgument,
            SpqrError::NotAdjacent => tonic::Code::InvalidArgument,
            SpqrError::ShardMismatch(_, _) => tonic::Code::FailedPrecondition,
            SpqrError::ShardUnavailable(_) => tonic::Code::Unavailable,
            SpqrError::PoolExhausted(_) => tonic::Code::ResourceExhausted,
            SpqrError::Timeout(_) => tonic::Code::DeadlineExceeded,
            SpqrError::StorageUnavailable(_) => tonic::Code::Unavailable,
            SpqrError::Internal(_) => tonic::Code::Internal,
        };

        Status::new(code, err.to_string())
    }
}

// Implement conversions from common error types
impl From<serde_json::Error> for SpqrError {
    fn from(err: serde_json::Error) -> Self {
        SpqrError::Internal(format!("serialization error: {}", err))
    }
}

impl From<std::io::Error> for SpqrError {
    fn from(err: std::io::Error) -> Self {
        SpqrError::Internal(format!("IO error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstates() {
        assert_eq!(SpqrError::AuthFailed("bad password".into()).sqlstate(), "28P01");
        assert_eq!(SpqrError::NoRouteForStatement("SELECT 1".into()).sqlstate(), "42P01");
        assert_eq!(SpqrError::RangeLocked("kr1".into()).sqlstate(), "55P03");
    }

    #[test]
    fn test_error_to_status() {
        let err = SpqrError::AlreadyLocked("kr1".into());
        let status: Status = err.into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    #[test]
    fn test_recoverable() {
        assert!(SpqrError::NoRouteForStatement("q".into()).is_recoverable());
        assert!(SpqrError::PoolExhausted("sh1".into()).is_recoverable());
        assert!(!SpqrError::Protocol("bad tag".into()).is_recoverable());
    }
}
