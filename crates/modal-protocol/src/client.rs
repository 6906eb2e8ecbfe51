// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC channel helpers and the raw invocation seam.
//!
//! [`RpcInvoker`] is the single boundary between the client SDK and the
//! network: requests and responses are opaque Protobuf payloads with their
//! metadata. [`GrpcInvoker`] implements it over a `tonic` channel; tests
//! substitute an in-memory implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;
use tonic::codegen::http::Uri;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, info, instrument};

use crate::codec::{MAX_MESSAGE_SIZE, RawCodec};

/// Errors that can occur while building a channel
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Configuration for a gRPC channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// HTTP/2 keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Maximum encoded/decoded message size in bytes
    pub max_message_size: usize,
    /// User agent sent on every request
    pub user_agent: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            keep_alive_interval_ms: 30_000,
            max_message_size: MAX_MESSAGE_SIZE,
            user_agent: format!("modal-rs/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Check that `url` is an absolute `http`/`https` URL with a host.
///
/// Runs before any connection attempt so malformed endpoints fail fast.
pub fn validate_endpoint(url: &str) -> Result<Uri, ClientError> {
    let invalid = |reason: &str| ClientError::InvalidEndpoint {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = url.parse().map_err(|e| invalid(&format!("{e}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        None => return Err(invalid("missing scheme")),
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(uri)
}

/// Build a lazily-connecting channel to `url`.
///
/// TLS with the webpki root store is enabled for `https` endpoints.
#[instrument(skip(config))]
pub fn connect(url: &str, config: &ChannelConfig) -> Result<Channel, ClientError> {
    let uri = validate_endpoint(url)?;
    let tls = uri.scheme_str() == Some("https");

    let mut endpoint = Endpoint::from(uri)
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .user_agent(config.user_agent.clone())?;

    if config.keep_alive_interval_ms > 0 {
        endpoint = endpoint
            .http2_keep_alive_interval(Duration::from_millis(config.keep_alive_interval_ms))
            .keep_alive_while_idle(true);
    }

    if tls {
        endpoint = endpoint.tls_config(ClientTlsConfig::new().with_webpki_roots())?;
    }

    info!(url, tls, "created lazy gRPC channel");
    Ok(endpoint.connect_lazy())
}

/// A unary or server-streaming call ready to be sent.
#[derive(Debug, Clone)]
pub struct RawRequest {
    /// Fully-qualified method path, e.g. `/modal.client.ModalClient/FunctionMap`
    pub method: &'static str,
    /// Encoded request message
    pub body: Bytes,
    /// Request metadata (headers)
    pub metadata: MetadataMap,
    /// Deadline sent to the server as `grpc-timeout`
    pub timeout: Option<Duration>,
}

impl RawRequest {
    pub fn new(method: &'static str, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            body: body.into(),
            metadata: MetadataMap::new(),
            timeout: None,
        }
    }
}

/// Reply to a unary call.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    /// Encoded response message
    pub body: Bytes,
    /// Response headers
    pub headers: MetadataMap,
    /// Response trailers (may be merged into `headers` by the transport)
    pub trailers: MetadataMap,
}

impl RawResponse {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }
}

/// Reply to a server-streaming call.
pub struct RawStream {
    /// Response headers
    pub headers: MetadataMap,
    /// Encoded messages in arrival order
    pub messages: BoxStream<'static, Result<Bytes, Status>>,
}

impl std::fmt::Debug for RawStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStream")
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Sends raw calls to a backend.
#[async_trait]
pub trait RpcInvoker: Send + Sync {
    /// Issue a unary call.
    async fn unary(&self, request: RawRequest) -> Result<RawResponse, Status>;

    /// Open a server-streaming call.
    async fn server_streaming(&self, request: RawRequest) -> Result<RawStream, Status>;
}

/// [`RpcInvoker`] backed by a `tonic` channel.
#[derive(Debug, Clone)]
pub struct GrpcInvoker {
    channel: Channel,
    max_message_size: usize,
}

impl GrpcInvoker {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Connect lazily to `url` and wrap the channel.
    pub fn connect(url: &str, config: &ChannelConfig) -> Result<Self, ClientError> {
        let channel = connect(url, config)?;
        Ok(Self {
            channel,
            max_message_size: config.max_message_size,
        })
    }

    async fn ready(&self) -> Result<tonic::client::Grpc<Channel>, Status> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone())
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
        Ok(grpc)
    }

    fn into_tonic_request(request: RawRequest) -> (PathAndQuery, Request<Bytes>) {
        let path = PathAndQuery::from_static(request.method);
        let mut tonic_request = Request::new(request.body);
        *tonic_request.metadata_mut() = request.metadata;
        if let Some(timeout) = request.timeout {
            tonic_request.set_timeout(timeout);
        }
        (path, tonic_request)
    }
}

#[async_trait]
impl RpcInvoker for GrpcInvoker {
    async fn unary(&self, request: RawRequest) -> Result<RawResponse, Status> {
        debug!(method = request.method, "unary call");
        let mut grpc = self.ready().await?;
        let (path, tonic_request) = Self::into_tonic_request(request);

        // tonic merges trailers into the response metadata for unary calls.
        let response = grpc.unary(tonic_request, path, RawCodec).await?;
        let (headers, body, _) = response.into_parts();
        Ok(RawResponse {
            body,
            headers,
            trailers: MetadataMap::new(),
        })
    }

    async fn server_streaming(&self, request: RawRequest) -> Result<RawStream, Status> {
        debug!(method = request.method, "server-streaming call");
        let mut grpc = self.ready().await?;
        let (path, tonic_request) = Self::into_tonic_request(request);

        let response = grpc.server_streaming(tonic_request, path, RawCodec).await?;
        let (headers, messages, _) = response.into_parts();
        Ok(RawStream {
            headers,
            messages: messages.boxed(),
        })
    }
}
