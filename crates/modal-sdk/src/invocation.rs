// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A single dispatched input and the protocol for awaiting its output.
//!
//! Two backends accept work. The control plane takes the input through
//! `FunctionMap` and hands back a call-level JWT plus a per-input JWT that
//! must accompany any resubmission. The input plane, reached on its own
//! endpoint, starts an "attempt" and identifies it by an attempt token that
//! each retry replaces. Both are driven through [`Invocation`]; polling only
//! depends on [`OutputSource`].

use std::time::Duration;

use async_trait::async_trait;
use modal_protocol::api::{self, FunctionCallInvocationType, FunctionCallType};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, SdkError};
use crate::output::{self, Output};
use crate::transport::ApiClient;

/// Longest time a single output request may block server-side.
pub const OUTPUTS_TIMEOUT: Duration = Duration::from_secs(55);

/// Something that can be asked for the current output of a call.
#[async_trait]
pub(crate) trait OutputSource: Send + Sync {
    /// Wait up to `timeout` for an output; `None` if none arrived.
    async fn fetch_output(&self, timeout: Duration) -> Result<Option<api::FunctionGetOutputsItem>>;
}

/// Uniform contract over control-plane and input-plane invocations.
#[async_trait]
pub(crate) trait Invocation: Send + Sync {
    /// Block until the output is available, `timeout` elapses, or the
    /// invocation's context finishes. `None` waits indefinitely.
    async fn await_output(&self, timeout: Option<Duration>) -> Result<Output>;

    /// Resubmit the input after an internal failure.
    async fn retry(&mut self, retry_count: u32) -> Result<()>;
}

/// Poll `source` until it yields an output.
///
/// Each request blocks for at most [`OUTPUTS_TIMEOUT`]. With an overall
/// `timeout`, each request is shortened to the time left and the loop fails
/// with [`SdkError::OutputTimeout`] once none is left.
pub(crate) async fn poll_output<S>(
    source: &S,
    timeout: Option<Duration>,
) -> Result<api::FunctionGetOutputsItem>
where
    S: OutputSource + ?Sized,
{
    let start = Instant::now();
    let mut poll_timeout = timeout.map_or(OUTPUTS_TIMEOUT, |t| t.min(OUTPUTS_TIMEOUT));

    loop {
        if let Some(item) = source.fetch_output(poll_timeout).await? {
            return Ok(item);
        }

        if let Some(timeout) = timeout {
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(SdkError::OutputTimeout(timeout));
            }
            poll_timeout = remaining.min(OUTPUTS_TIMEOUT);
        }
        debug!(poll_timeout_ms = poll_timeout.as_millis() as u64, "no output yet");
    }
}

/// Seconds since the Unix epoch, as sent in `requested_at` fields.
pub(crate) fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Invocation dispatched through the control plane.
pub(crate) struct ControlPlaneInvocation {
    client: Client,
    ctx: Context,
    function_call_id: String,
    input: Option<api::FunctionInput>,
    function_call_jwt: String,
    input_jwt: String,
}

impl ControlPlaneInvocation {
    /// Submit `input` to `function_id` as a single-input call.
    #[instrument(skip(client, ctx, input))]
    pub(crate) async fn create(
        client: &Client,
        ctx: &Context,
        function_id: &str,
        input: api::FunctionInput,
        invocation_type: FunctionCallInvocationType,
    ) -> Result<Self> {
        let response = client
            .control_plane()
            .function_map(
                ctx,
                api::FunctionMapRequest {
                    function_id: function_id.to_string(),
                    function_call_type: FunctionCallType::Unary as i32,
                    function_call_invocation_type: invocation_type as i32,
                    pipelined_inputs: vec![api::FunctionPutInputsItem {
                        idx: 0,
                        input: Some(input.clone()),
                    }],
                    ..Default::default()
                },
            )
            .await?;

        let input_jwt = response
            .pipelined_inputs
            .into_iter()
            .next()
            .map(|item| item.input_jwt)
            .ok_or_else(|| {
                SdkError::Execution("FunctionMap returned no pipelined inputs".to_string())
            })?;

        info!(function_call_id = %response.function_call_id, "function call created");
        Ok(Self {
            client: client.clone(),
            ctx: ctx.clone(),
            function_call_id: response.function_call_id,
            input: Some(input),
            function_call_jwt: response.function_call_jwt,
            input_jwt,
        })
    }

    /// Attach to an existing call. The input is unknown, so it cannot be retried.
    pub(crate) fn from_function_call_id(
        client: &Client,
        ctx: &Context,
        function_call_id: impl Into<String>,
    ) -> Self {
        Self {
            client: client.clone(),
            ctx: ctx.clone(),
            function_call_id: function_call_id.into(),
            input: None,
            function_call_jwt: String::new(),
            input_jwt: String::new(),
        }
    }

    pub(crate) fn function_call_id(&self) -> &str {
        &self.function_call_id
    }
}

#[async_trait]
impl OutputSource for ControlPlaneInvocation {
    async fn fetch_output(&self, timeout: Duration) -> Result<Option<api::FunctionGetOutputsItem>> {
        let response = self
            .client
            .control_plane()
            .function_get_outputs(
                &self.ctx,
                api::FunctionGetOutputsRequest {
                    function_call_id: self.function_call_id.clone(),
                    max_values: 1,
                    timeout: timeout.as_secs_f32(),
                    last_entry_id: "0-0".to_string(),
                    clear_on_success: true,
                    requested_at: now_seconds(),
                },
            )
            .await?;
        Ok(response.outputs.into_iter().next())
    }
}

#[async_trait]
impl Invocation for ControlPlaneInvocation {
    async fn await_output(&self, timeout: Option<Duration>) -> Result<Output> {
        let item = poll_output(self, timeout).await?;
        output::process_item(&self.client, &self.ctx, item).await
    }

    async fn retry(&mut self, retry_count: u32) -> Result<()> {
        let Some(input) = self.input.clone() else {
            return Err(SdkError::Invalid(
                "cannot retry function invocation: input missing".to_string(),
            ));
        };

        let response = self
            .client
            .control_plane()
            .function_retry_inputs(
                &self.ctx,
                api::FunctionRetryInputsRequest {
                    function_call_jwt: self.function_call_jwt.clone(),
                    inputs: vec![api::FunctionRetryInputsItem {
                        input_jwt: self.input_jwt.clone(),
                        input: Some(input),
                        retry_count,
                    }],
                },
            )
            .await?;

        self.input_jwt = response.input_jwts.into_iter().next().ok_or_else(|| {
            SdkError::Execution("FunctionRetryInputs returned no input JWT".to_string())
        })?;
        debug!(function_call_id = %self.function_call_id, retry_count, "input resubmitted");
        Ok(())
    }
}

/// Invocation dispatched through an input-plane endpoint.
pub(crate) struct InputPlaneInvocation {
    client: Client,
    api: ApiClient,
    ctx: Context,
    function_id: String,
    input: api::FunctionPutInputsItem,
    attempt_token: String,
}

impl InputPlaneInvocation {
    #[instrument(skip(client, ctx, input))]
    pub(crate) async fn create(
        client: &Client,
        ctx: &Context,
        input_plane_url: &str,
        function_id: &str,
        input: api::FunctionInput,
    ) -> Result<Self> {
        let api = client.connection(input_plane_url)?;
        let input = api::FunctionPutInputsItem {
            idx: 0,
            input: Some(input),
        };
        let response = api
            .attempt_start(
                ctx,
                api::AttemptStartRequest {
                    function_id: function_id.to_string(),
                    input: Some(input.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!(url = api.url(), "attempt started");
        Ok(Self {
            client: client.clone(),
            api,
            ctx: ctx.clone(),
            function_id: function_id.to_string(),
            input,
            attempt_token: response.attempt_token,
        })
    }
}

#[async_trait]
impl OutputSource for InputPlaneInvocation {
    async fn fetch_output(&self, timeout: Duration) -> Result<Option<api::FunctionGetOutputsItem>> {
        let response = self
            .api
            .attempt_await(
                &self.ctx,
                api::AttemptAwaitRequest {
                    attempt_token: self.attempt_token.clone(),
                    requested_at: now_seconds(),
                    timeout_secs: timeout.as_secs_f32(),
                },
            )
            .await?;
        Ok(response.output)
    }
}

#[async_trait]
impl Invocation for InputPlaneInvocation {
    async fn await_output(&self, timeout: Option<Duration>) -> Result<Output> {
        let item = poll_output(self, timeout).await?;
        output::process_item(&self.client, &self.ctx, item).await
    }

    /// Start a fresh attempt with the same input. Retry counters are a
    /// control-plane concept and are not sent.
    async fn retry(&mut self, _retry_count: u32) -> Result<()> {
        let response = self
            .api
            .attempt_retry(
                &self.ctx,
                api::AttemptRetryRequest {
                    function_id: self.function_id.clone(),
                    input: Some(self.input.clone()),
                    attempt_token: self.attempt_token.clone(),
                    ..Default::default()
                },
            )
            .await?;
        self.attempt_token = response.attempt_token;
        debug!(url = self.api.url(), "attempt restarted");
        Ok(())
    }
}
