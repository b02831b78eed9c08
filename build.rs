use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_dir = PathBuf::from("proto");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=proto/");

    // The guard service is served by this crate; the decision service is
    // consumed by the external adapter, so both sides are generated.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_dir.join("otpguard/v1/otpguard.proto")], &[&proto_dir])?;

    Ok(())
}
