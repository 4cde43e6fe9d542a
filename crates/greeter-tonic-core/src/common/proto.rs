//! Generated protobuf messages and gRPC bindings for the `greeter` package.
//!
//! Both the server trait ([`greeter_server::Greeter`]) and the client
//! ([`greeter_client::GreeterClient`]) are generated, so the server binary,
//! its tests and its benchmarks share one contract.

tonic::include_proto!("greeter");

/// Encoded `FileDescriptorSet` for `greeter.proto`, served through gRPC
/// reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("greeter_descriptor");
