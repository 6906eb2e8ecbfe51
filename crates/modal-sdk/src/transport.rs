// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed API client over one endpoint.
//!
//! [`ApiClient`] encodes typed Protobuf requests, sends them through the
//! middleware chain (unary) or the auth layer (server streaming), and
//! decodes the replies.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use modal_protocol::api::{self, methods};
use modal_protocol::{RawRequest, RpcInvoker};
use prost::Message;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::debug;

use crate::context::Context;
use crate::middleware::{AuthMiddleware, Middleware, Next, RpcCall, default_chain};
use crate::retry::CallOptions;

/// Decoded server-streaming reply.
pub(crate) type MessageStream<T> = BoxStream<'static, Result<T, Status>>;

/// Client for one backend endpoint with the middleware chain applied.
#[derive(Clone)]
pub(crate) struct ApiClient {
    url: Arc<str>,
    invoker: Arc<dyn RpcInvoker>,
    auth: Arc<AuthMiddleware>,
    chain: Arc<[Arc<dyn Middleware>]>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("url", &self.url)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

macro_rules! unary_rpcs {
    ($($name:ident($method:ident, $req:ty) -> $resp:ty;)*) => {
        $(
            pub(crate) async fn $name(
                &self,
                ctx: &Context,
                request: $req,
            ) -> Result<$resp, Status> {
                self.unary(ctx, methods::$method, &request, CallOptions::default()).await
            }
        )*
    };
}

impl ApiClient {
    pub(crate) fn new(url: &str, invoker: Arc<dyn RpcInvoker>, auth: Arc<AuthMiddleware>) -> Self {
        let chain = default_chain(auth.clone());
        Self {
            url: url.into(),
            invoker,
            auth,
            chain,
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Send a unary request through the full chain.
    pub(crate) async fn unary<Req, Resp>(
        &self,
        ctx: &Context,
        method: &'static str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp, Status>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let call = RpcCall {
            method,
            body: Bytes::from(request.encode_to_vec()),
            metadata: MetadataMap::new(),
            options,
            ctx: ctx.clone(),
        };
        let response = Next::new(&self.chain, self.invoker.as_ref())
            .run(call)
            .await?;
        Resp::decode(response.body)
            .map_err(|e| Status::internal(format!("failed to decode {method} response: {e}")))
    }

    /// Open a server-streaming call.
    ///
    /// Streams bypass the retry layer: their consumers resubscribe from a
    /// cursor instead of replaying the call.
    pub(crate) async fn server_streaming<Req, Resp>(
        &self,
        ctx: &Context,
        method: &'static str,
        request: &Req,
    ) -> Result<MessageStream<Resp>, Status>
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        let mut raw = RawRequest::new(method, request.encode_to_vec());
        self.auth.attach(&mut raw.metadata);
        raw.timeout = ctx.remaining();

        debug!(url = %self.url, method, "opening stream");
        let stream = ctx.run(self.invoker.server_streaming(raw)).await?;
        self.auth.harvest(&stream.headers, &MetadataMap::new());

        Ok(stream
            .messages
            .map(move |item| {
                item.and_then(|body| {
                    Resp::decode(body).map_err(|e| {
                        Status::internal(format!("failed to decode {method} message: {e}"))
                    })
                })
            })
            .boxed())
    }

    unary_rpcs! {
        function_get(FUNCTION_GET, api::FunctionGetRequest) -> api::FunctionGetResponse;
        function_bind_params(FUNCTION_BIND_PARAMS, api::FunctionBindParamsRequest)
            -> api::FunctionBindParamsResponse;
        function_map(FUNCTION_MAP, api::FunctionMapRequest) -> api::FunctionMapResponse;
        function_retry_inputs(FUNCTION_RETRY_INPUTS, api::FunctionRetryInputsRequest)
            -> api::FunctionRetryInputsResponse;
        function_get_outputs(FUNCTION_GET_OUTPUTS, api::FunctionGetOutputsRequest)
            -> api::FunctionGetOutputsResponse;
        function_call_cancel(FUNCTION_CALL_CANCEL, api::FunctionCallCancelRequest) -> api::Empty;
        attempt_start(ATTEMPT_START, api::AttemptStartRequest) -> api::AttemptStartResponse;
        attempt_await(ATTEMPT_AWAIT, api::AttemptAwaitRequest) -> api::AttemptAwaitResponse;
        attempt_retry(ATTEMPT_RETRY, api::AttemptRetryRequest) -> api::AttemptRetryResponse;
        blob_create(BLOB_CREATE, api::BlobCreateRequest) -> api::BlobCreateResponse;
        blob_get(BLOB_GET, api::BlobGetRequest) -> api::BlobGetResponse;
        queue_get_or_create(QUEUE_GET_OR_CREATE, api::QueueGetOrCreateRequest)
            -> api::QueueGetOrCreateResponse;
        queue_delete(QUEUE_DELETE, api::QueueDeleteRequest) -> api::Empty;
        queue_heartbeat(QUEUE_HEARTBEAT, api::QueueHeartbeatRequest) -> api::Empty;
        queue_clear(QUEUE_CLEAR, api::QueueClearRequest) -> api::Empty;
        queue_get(QUEUE_GET, api::QueueGetRequest) -> api::QueueGetResponse;
        queue_put(QUEUE_PUT, api::QueuePutRequest) -> api::Empty;
        queue_len(QUEUE_LEN, api::QueueLenRequest) -> api::QueueLenResponse;
        queue_next_items(QUEUE_NEXT_ITEMS, api::QueueNextItemsRequest)
            -> api::QueueNextItemsResponse;
        sandbox_create(SANDBOX_CREATE, api::SandboxCreateRequest) -> api::SandboxCreateResponse;
        sandbox_wait(SANDBOX_WAIT, api::SandboxWaitRequest) -> api::SandboxWaitResponse;
        sandbox_terminate(SANDBOX_TERMINATE, api::SandboxTerminateRequest)
            -> api::SandboxTerminateResponse;
        sandbox_get_task_id(SANDBOX_GET_TASK_ID, api::SandboxGetTaskIdRequest)
            -> api::SandboxGetTaskIdResponse;
        sandbox_get_tunnels(SANDBOX_GET_TUNNELS, api::SandboxGetTunnelsRequest)
            -> api::SandboxGetTunnelsResponse;
        sandbox_snapshot_fs(SANDBOX_SNAPSHOT_FS, api::SandboxSnapshotFsRequest)
            -> api::SandboxSnapshotFsResponse;
        sandbox_stdin_write(SANDBOX_STDIN_WRITE, api::SandboxStdinWriteRequest) -> api::Empty;
        container_exec(CONTAINER_EXEC, api::ContainerExecRequest) -> api::ContainerExecResponse;
        container_exec_put_input(CONTAINER_EXEC_PUT_INPUT, api::ContainerExecPutInputRequest)
            -> api::Empty;
        container_exec_wait(CONTAINER_EXEC_WAIT, api::ContainerExecWaitRequest)
            -> api::ContainerExecWaitResponse;
    }

    pub(crate) async fn sandbox_get_logs(
        &self,
        ctx: &Context,
        request: api::SandboxGetLogsRequest,
    ) -> Result<MessageStream<api::TaskLogsBatch>, Status> {
        self.server_streaming(ctx, methods::SANDBOX_GET_LOGS, &request)
            .await
    }

    pub(crate) async fn container_exec_get_output(
        &self,
        ctx: &Context,
        request: api::ContainerExecGetOutputRequest,
    ) -> Result<MessageStream<api::RuntimeOutputBatch>, Status> {
        self.server_streaming(ctx, methods::CONTAINER_EXEC_GET_OUTPUT, &request)
            .await
    }
}
