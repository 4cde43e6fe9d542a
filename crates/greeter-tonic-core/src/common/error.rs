//! Error types for the greeter service.
//!
//! This module defines the central `Error` enum covering every failure the
//! service reports on its own behalf. It implements `From<Error>` for
//! `tonic::Status` so handlers can return it with `?`.
//!
//! Errors that arrive on a client's request stream are not wrapped here; they
//! are forwarded to the caller as the original `Status`.
//!
//! ## Error Cases
//! - `InvalidArgument`: the request failed validation (e.g. an empty name).
//! - `ChannelError`: an internal channel between tasks or workers closed.
//! - `RequestCancelled`: the call was cancelled before it could complete.
//! - `ServiceShutdown`: a request arrived while the service was shutting down.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the greeter service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The request failed validation.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Internal channel send/receive failure (e.g., closed worker channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The call was cancelled by the client or the server.
    #[error("Request cancelled")]
    RequestCancelled,

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArgument { reason } => Status::invalid_argument(reason),
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {}", context))
            }
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
