// SPDX-License-Identifier: MIT OR Apache-2.0

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // protox compiles the .proto sources in-process, so no system protoc
    // installation is needed.
    let file_descriptors = protox::compile(
        ["proto/registration.proto", "proto/echo.proto"],
        ["proto"],
    )?;

    tonic_build::compile_fds(file_descriptors)?;

    println!("cargo:rerun-if-changed=proto/registration.proto");
    println!("cargo:rerun-if-changed=proto/echo.proto");
    Ok(())
}
