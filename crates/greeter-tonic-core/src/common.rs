//! Items shared by the greeter client and server.
//!
//! - [`proto`] - generated gRPC bindings and the reflection descriptor set.
//! - [`types`] - the greeting formatting rule and reply constructors.
//! - [`error`] - the service error type and its `tonic::Status` mapping.

pub mod error;
pub mod proto;
pub mod types;

pub use error::{Error, Result};
