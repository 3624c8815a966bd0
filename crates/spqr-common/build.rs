use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("vendored protoc binary"),
    );

    let proto_root = PathBuf::from("../../proto");

    let protos = [proto_root.join("spqr/v1/router.proto")];

    // Re-run if proto files change
    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto.display());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&protos, &[proto_root])?;

    Ok(())
}
