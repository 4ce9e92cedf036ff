fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use bundled protoc
    // SAFETY: This is safe in a build script context where we control the environment
    unsafe {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Compile the protobuf file into Rust code
    tonic_prost_build::configure()
        .build_client(true) // Adapter is gRPC client only
        .build_server(false)
        .compile_protos(&["../vmagent/proto/vmagent.proto"], &["../vmagent/proto"])?;

    Ok(())
}
