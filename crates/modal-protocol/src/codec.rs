// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pass-through gRPC codec.
//!
//! Messages travel through the client middleware as already-encoded
//! Protobuf bytes, so the codec only copies buffers in and out of the
//! HTTP/2 frames. Encoding and decoding of the typed messages happens at the
//! edges (see `modal-sdk`'s API client).

use bytes::{Buf, BufMut, Bytes};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// Maximum gRPC message size (100 MiB), matching the API server.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Codec whose request and response items are raw Protobuf payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        if item.len() > MAX_MESSAGE_SIZE {
            return Err(Status::resource_exhausted(format!(
                "message too large: {} bytes (max: {MAX_MESSAGE_SIZE})",
                item.len()
            )));
        }
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}
