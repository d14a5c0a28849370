use std::error::Error;

use vergen::{BuildBuilder, Emitter, RustcBuilder};

fn main() -> Result<(), Box<dyn Error>> {
    let build = BuildBuilder::all_build()?;
    let rustc = RustcBuilder::all_rustc()?;

    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&rustc)?
        .emit()?;

    let proto_files = ["./proto/snapshots.proto"];

    println!("cargo:rerun-if-changed=proto");
    tonic_build::configure()
        .build_client(false) // containerd is the only client
        .build_server(true)
        .protoc_arg("--experimental_allow_proto3_optional") // Required for building on Ubuntu 22.04
        .compile_protos(&proto_files, &["proto"])?;
    Ok(())
}
