// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handles to dispatched calls that are consumed later.

use std::time::Duration;

use modal_protocol::api;
use tracing::{info, instrument};

use crate::client::Client;
use crate::context::Context;
use crate::error::Result;
use crate::invocation::{ControlPlaneInvocation, Invocation};
use crate::output::Output;

/// A function call whose output can be fetched or which can be cancelled.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    client: Client,
    ctx: Context,
    function_call_id: String,
}

impl FunctionCall {
    pub(crate) fn new(client: &Client, ctx: &Context, function_call_id: String) -> Self {
        Self {
            client: client.clone(),
            ctx: ctx.clone(),
            function_call_id,
        }
    }

    /// Reference an existing call by id.
    pub fn from_id(client: &Client, function_call_id: impl Into<String>) -> Self {
        Self::new(client, client.context(), function_call_id.into())
    }

    pub fn function_call_id(&self) -> &str {
        &self.function_call_id
    }

    /// Run subsequent calls under `ctx` instead of the context it was created with.
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    /// Wait for the call's output.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` checks once whether
    /// the call has already finished.
    #[instrument(skip(self), fields(function_call_id = %self.function_call_id))]
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Output> {
        let invocation = ControlPlaneInvocation::from_function_call_id(
            &self.client,
            &self.ctx,
            &self.function_call_id,
        );
        invocation.await_output(timeout).await
    }

    /// Cancel the call, optionally terminating the containers running it.
    #[instrument(skip(self), fields(function_call_id = %self.function_call_id))]
    pub async fn cancel(&self, terminate_containers: bool) -> Result<()> {
        self.client
            .control_plane()
            .function_call_cancel(
                &self.ctx,
                api::FunctionCallCancelRequest {
                    function_call_id: self.function_call_id.clone(),
                    terminate_containers,
                },
            )
            .await?;
        info!("function call cancelled");
        Ok(())
    }
}
