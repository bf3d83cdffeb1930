//! Error types for the query-frontend dispatcher.
//!
//! This module defines the central `Error` enum, which captures all
//! recoverable and reportable error cases of the dispatcher. It implements
//! `From<Error>` for `tonic::Status` so the gRPC surfaces can propagate
//! failures to their peers with appropriate status codes.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the query-frontend dispatcher.
#[derive(Clone, thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The caller did not carry a tenant identifier.
    #[error("no tenant id found on the request context")]
    MissingTenant,

    /// No scheduler worker could accept the request: the pool is empty, or
    /// every worker mailbox stayed full for a whole selection rotation.
    #[error("no schedulers are available to accept the request")]
    NoSchedulers,

    /// The scheduler rejected the enqueue, or the retry budget was exhausted
    /// while every scheduler reported it was shutting down.
    #[error("failed to enqueue request")]
    EnqueueFailed,

    /// The caller cancelled the request before a result arrived.
    #[error("request cancelled by caller")]
    Cancelled,

    /// The caller's deadline expired before a result arrived.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The frontend is in the process of shutting down.
    #[error("service is shutting down")]
    ServiceShutdown,

    /// A result was delivered for a tenant other than the one that issued
    /// the query.
    #[error("result delivered for tenant {got}, but query belongs to tenant {expected}")]
    TenantMismatch { expected: String, got: String },

    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("channel error: {context}")]
    ChannelError { context: String },
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::MissingTenant => Self::unauthenticated(err.to_string()),
            Error::NoSchedulers | Error::ServiceShutdown => Self::unavailable(err.to_string()),
            Error::EnqueueFailed => Self::internal(err.to_string()),
            Error::Cancelled => Self::cancelled(err.to_string()),
            Error::DeadlineExceeded => Self::deadline_exceeded(err.to_string()),
            Error::TenantMismatch { .. } => Self::permission_denied(err.to_string()),
            Error::ChannelError { .. } => Self::internal(err.to_string()),
        }
    }
}
