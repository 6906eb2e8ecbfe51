// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployed functions.

use bytes::Bytes;
use modal_protocol::api::{
    self, DataFormat, DeploymentNamespace, FunctionCallInvocationType, function_input::ArgsOneof,
};
use tracing::{info, instrument, warn};

use crate::blob;
use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, SdkError};
use crate::function_call::FunctionCall;
use crate::invocation::{ControlPlaneInvocation, InputPlaneInvocation, Invocation};
use crate::output::Output;
use crate::pickle::{self, Kwargs, Value};

/// Resubmissions allowed after the backend reports an internal failure.
pub const MAX_SYSTEM_RETRIES: u32 = 8;

/// Handle to a deployed function (or to one method of a deployed class).
#[derive(Debug, Clone)]
pub struct Function {
    client: Client,
    ctx: Context,
    function_id: String,
    method_name: Option<String>,
    input_plane_url: Option<String>,
}

impl Function {
    /// Look up function `name` in app `app_name`.
    #[instrument(skip(client))]
    pub async fn lookup(
        client: &Client,
        app_name: &str,
        name: &str,
        environment: Option<&str>,
    ) -> Result<Self> {
        let ctx = client.context().clone();
        let response = client
            .control_plane()
            .function_get(
                &ctx,
                api::FunctionGetRequest {
                    app_name: app_name.to_string(),
                    object_tag: name.to_string(),
                    namespace: DeploymentNamespace::Workspace as i32,
                    environment_name: client.environment_name(environment),
                },
            )
            .await
            .map_err(|status| {
                SdkError::not_found_or(status, || format!("function '{app_name}/{name}' not found"))
            })?;

        let input_plane_url = response
            .handle_metadata
            .and_then(|metadata| metadata.input_plane_url)
            .filter(|url| !url.is_empty());

        Ok(Self {
            client: client.clone(),
            ctx,
            function_id: response.function_id,
            method_name: None,
            input_plane_url,
        })
    }

    pub(crate) fn from_parts(
        client: &Client,
        ctx: &Context,
        function_id: String,
        method_name: Option<String>,
        input_plane_url: Option<String>,
    ) -> Self {
        Self {
            client: client.clone(),
            ctx: ctx.clone(),
            function_id,
            method_name,
            input_plane_url,
        }
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn method_name(&self) -> Option<&str> {
        self.method_name.as_deref()
    }

    pub fn input_plane_url(&self) -> Option<&str> {
        self.input_plane_url.as_deref()
    }

    /// Run subsequent calls under `ctx` instead of the client's root context.
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    /// Call the function and wait for its result.
    ///
    /// Internal failures reported by the backend are retried up to
    /// [`MAX_SYSTEM_RETRIES`] times with the same input.
    #[instrument(skip(self, args, kwargs), fields(function_id = %self.function_id))]
    pub async fn remote(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Output> {
        let input = self.create_input(args, kwargs).await?;
        let mut invocation: Box<dyn Invocation> = match &self.input_plane_url {
            Some(url) => Box::new(
                InputPlaneInvocation::create(&self.client, &self.ctx, url, &self.function_id, input)
                    .await?,
            ),
            None => Box::new(
                ControlPlaneInvocation::create(
                    &self.client,
                    &self.ctx,
                    &self.function_id,
                    input,
                    FunctionCallInvocationType::Sync,
                )
                .await?,
            ),
        };

        let mut retry_count = 0;
        loop {
            match invocation.await_output(None).await {
                Err(SdkError::InternalFailure(reason)) if retry_count < MAX_SYSTEM_RETRIES => {
                    retry_count += 1;
                    warn!(retry_count, %reason, "internal failure, resubmitting input");
                    invocation.retry(retry_count).await?;
                }
                result => return result,
            }
        }
    }

    /// Start the function without waiting for its result.
    #[instrument(skip(self, args, kwargs), fields(function_id = %self.function_id))]
    pub async fn spawn(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<FunctionCall> {
        let input = self.create_input(args, kwargs).await?;
        let invocation = ControlPlaneInvocation::create(
            &self.client,
            &self.ctx,
            &self.function_id,
            input,
            FunctionCallInvocationType::Async,
        )
        .await?;
        info!(function_call_id = invocation.function_call_id(), "spawned");
        Ok(FunctionCall::new(
            &self.client,
            &self.ctx,
            invocation.function_call_id().to_string(),
        ))
    }

    async fn create_input(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<api::FunctionInput> {
        let payload = Bytes::from(pickle::serialize_args(args, kwargs)?);
        let args_oneof = if blob::needs_upload(payload.len()) {
            ArgsOneof::ArgsBlobId(blob::upload(&self.client, &self.ctx, payload).await?)
        } else {
            ArgsOneof::Args(payload.to_vec())
        };

        Ok(api::FunctionInput {
            final_input: false,
            data_format: DataFormat::Pickle as i32,
            method_name: self.method_name.clone(),
            args_oneof: Some(args_oneof),
        })
    }
}
