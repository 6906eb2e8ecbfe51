// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io::Result;

fn main() -> Result<()> {
    let protoc = protoc_bin_vendored::protoc_bin_path()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;

    // Compile the client API (messages only, calls go through the raw codec)
    prost_build::Config::new()
        .protoc_executable(protoc)
        .compile_protos(&["proto/api.proto"], &["proto/"])?;

    Ok(())
}
