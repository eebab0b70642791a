//! Build script for opscenter-proto
//!
//! Compiles protobuf definitions using tonic-prost-build and a vendored
//! `protoc`, so builds do not depend on a system protobuf compiler.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = "../../proto";

    let protos = [
        "opscenter/v1/common.proto",
        "opscenter/v1/tokens.proto",
        "opscenter/v1/servers.proto",
        "opscenter/v1/provisioning.proto",
        "opscenter/v1/clusters.proto",
        "opscenter/v1/inventory.proto",
    ];

    let proto_paths: Vec<_> = protos
        .iter()
        .map(|p| format!("{proto_root}/{p}"))
        .collect();

    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| format!("{e:?}"))?;
        set_protoc(&protoc);
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&proto_paths, &[proto_root.to_string()])?;

    for path in &proto_paths {
        println!("cargo:rerun-if-changed={path}");
    }

    Ok(())
}

/// Point prost at the vendored compiler.
#[allow(unsafe_code)]
fn set_protoc(path: &std::path::Path) {
    // Build scripts are single-threaded, so mutating the environment is sound here.
    unsafe {
        std::env::set_var("PROTOC", path);
    }
}
