/// Builds the gRPC client and server code for `greeter.proto` using
/// `tonic-prost-build`.
///
/// The encoded `FileDescriptorSet` is written next to the generated code so
/// the server can expose it through gRPC reflection.
///
/// # Files and Paths
///
/// - Proto file: `proto/greeter.proto`
/// - Includes: `proto/`
/// - Descriptor: `$OUT_DIR/greeter_descriptor.bin`
///
/// # Panics
///
/// Panics if `OUT_DIR` is unset or code generation fails.
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("greeter_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/greeter.proto"], &["proto"])
        .unwrap();

    println!("cargo:rerun-if-changed=proto/greeter.proto");
}
