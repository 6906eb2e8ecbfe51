// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Modal Protocol - gRPC + Protobuf communication layer
//!
//! This crate provides the wire protocol between the client SDK and the
//! Modal API servers (control plane and input plane).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      modal-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Invocation seam: RpcInvoker (unary + server streaming)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Codec: raw Protobuf bytes, `api` built from api.proto      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: HTTP/2 gRPC (tonic), TLS via webpki roots       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use modal_protocol::{ChannelConfig, GrpcInvoker, RawRequest, RpcInvoker, api};
//! use prost::Message;
//!
//! let invoker = GrpcInvoker::connect("https://api.modal.com:443", &ChannelConfig::default())?;
//!
//! let request = api::BlobGetRequest { blob_id: "bl-123".to_string() };
//! let response = invoker
//!     .unary(RawRequest::new(api::methods::BLOB_GET, request.encode_to_vec()))
//!     .await?;
//! let reply = api::BlobGetResponse::decode(response.body)?;
//! ```

pub mod api;
pub mod client;
pub mod codec;

pub use client::{
    ChannelConfig, ClientError, GrpcInvoker, RawRequest, RawResponse, RawStream, RpcInvoker,
    connect, validate_endpoint,
};
pub use codec::{MAX_MESSAGE_SIZE, RawCodec};

// Re-exported so dependants agree on the exact versions used on the wire.
pub use prost;
pub use tonic;
