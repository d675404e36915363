use std::io::Result;

fn main() -> Result<()> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/runtime.proto", "proto/intake.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/runtime.proto");
    println!("cargo:rerun-if-changed=proto/intake.proto");
    Ok(())
}
