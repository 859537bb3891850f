//! Status values returned by client operations.
//!
//! Every fallible client call returns a [`Status`]. The variants mirror the
//! failure classes a caller has to distinguish: bad requests, misuse of a
//! handle, missing objects, key conflicts, transport trouble, deadline expiry
//! and the aggregate outcome of a flush round.

use thiserror::Error;

/// Result alias used across the client crate.
pub type Result<T, E = Status> = std::result::Result<T, E>;

/// Error status for a client or server operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Status {
    /// The request was malformed (unknown column, wrong value type, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle is not in a state that allows the call.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// No such table, tablet or scanner.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A row with the same primary key already exists.
    #[error("Already present: {0}")]
    AlreadyPresent(String),

    /// The destination could not be reached.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A deadline or per-RPC timeout expired.
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// A flush round produced at least one failed operation. The per-row
    /// reasons are pulled from the session's error collector.
    #[error("IO error: Some errors occurred ({failed} failed operations)")]
    Aggregate {
        /// Number of error records the round produced.
        failed: usize,
    },
}

/// Copyable classification of a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    IllegalState,
    NotFound,
    AlreadyPresent,
    NetworkError,
    TimedOut,
    Aggregate,
}

impl Status {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_present(msg: impl Into<String>) -> Self {
        Self::AlreadyPresent(msg.into())
    }

    pub fn network_error(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    pub fn timed_out(msg: impl Into<String>) -> Self {
        Self::TimedOut(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Status::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Status::IllegalState(_) => ErrorKind::IllegalState,
            Status::NotFound(_) => ErrorKind::NotFound,
            Status::AlreadyPresent(_) => ErrorKind::AlreadyPresent,
            Status::NetworkError(_) => ErrorKind::NetworkError,
            Status::TimedOut(_) => ErrorKind::TimedOut,
            Status::Aggregate { .. } => ErrorKind::Aggregate,
        }
    }

    /// Transport-level failures that justify finding a new leader.
    pub fn is_retriable_transport(&self) -> bool {
        matches!(self, Status::NetworkError(_) | Status::TimedOut(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_match_kind() {
        let err = Status::illegal_state("Key not specified: INSERT uint32 int_val=1");
        assert_eq!(
            err.to_string(),
            "Illegal state: Key not specified: INSERT uint32 int_val=1"
        );
        assert_eq!(err.kind(), ErrorKind::IllegalState);

        let err = Status::Aggregate { failed: 2 };
        assert!(err.to_string().contains("Some errors occurred"));
        assert_eq!(err.kind(), ErrorKind::Aggregate);
    }

    #[test]
    fn only_network_and_timeout_are_retriable() {
        assert!(Status::network_error("connection refused").is_retriable_transport());
        assert!(Status::timed_out("rpc").is_retriable_transport());
        assert!(!Status::not_found("table").is_retriable_transport());
        assert!(!Status::Aggregate { failed: 1 }.is_retriable_transport());
    }
}
