//! Builds the gRPC client and server bindings for `querygate.proto` with
//! `tonic-build`, emitting a file descriptor set alongside so the server can
//! offer gRPC reflection.

use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("querygate_descriptor.bin");

    // Fall back to the vendored protoc so the build does not depend on a
    // system-wide protobuf installation.
    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .file_descriptor_set_path(&descriptor_path)
        .compile_protos(&["proto/querygate.proto"], &["proto"])?;

    Ok(())
}
