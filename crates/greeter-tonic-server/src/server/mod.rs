//! Server-side components of the greeter service.
//!
//! - [`config`] - CLI/environment configuration.
//! - [`router`] - the gRPC router and its graceful shutdown sequence.
//! - [`service`] - the `Greeter` implementation and per-call contexts.
//! - [`streaming`] - stream coordinators for the streaming call shapes.
//! - [`telemetry`] - logging and optional OpenTelemetry export.

pub mod config;
pub mod router;
pub mod service;
pub mod streaming;
pub mod telemetry;
