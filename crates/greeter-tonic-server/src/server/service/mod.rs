//! gRPC service implementation.
//!
//! - [`handler`] - the `Greeter` implementation (`GreetingService`).
//! - [`context`] - per-call execution contexts and in-flight call tracking.

pub mod context;
pub mod handler;
