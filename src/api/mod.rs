// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generated protobuf types (low-level).

pub mod registration {
    tonic::include_proto!("registration.v1");
}

pub mod echo {
    tonic::include_proto!("echo.v1");
}
