// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call middleware: auth token exchange, retry, timeout.
//!
//! Every unary RPC runs through an ordered chain composed once per
//! connection. Each middleware receives the call plus [`Next`], the rest of
//! the chain, and may invoke it zero or more times:
//!
//! ```text
//!   caller ──► Auth ──► Retry ──► Timeout ──► RpcInvoker
//!              (attach / harvest)  (per-attempt deadline)
//! ```

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use modal_protocol::{RawRequest, RawResponse, RpcInvoker};
use tokio::time::Instant;
use tonic::Status;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tracing::{debug, warn};

use crate::config::Profile;
use crate::context::Context;
use crate::retry::{CallOptions, RetryPolicy};

pub const CLIENT_TYPE_HEADER: &str = "x-modal-client-type";
pub const CLIENT_VERSION_HEADER: &str = "x-modal-client-version";
pub const TOKEN_ID_HEADER: &str = "x-modal-token-id";
pub const TOKEN_SECRET_HEADER: &str = "x-modal-token-secret";
pub const AUTH_TOKEN_HEADER: &str = "x-modal-auth-token";
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
pub const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";
pub const RETRY_DELAY_HEADER: &str = "x-retry-delay";

/// Protocol version reported to the server.
pub const CLIENT_VERSION: &str = "1.0.0";

/// One logical RPC travelling through the chain.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub method: &'static str,
    pub body: bytes::Bytes,
    pub metadata: MetadataMap,
    pub options: CallOptions,
    pub ctx: Context,
}

/// A step in the call chain.
#[async_trait]
pub trait Middleware: Send + Sync + fmt::Debug {
    async fn call(&self, call: RpcCall, next: Next<'_>) -> Result<RawResponse, Status>;
}

/// The remainder of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    invoker: &'a dyn RpcInvoker,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], invoker: &'a dyn RpcInvoker) -> Self {
        Self { chain, invoker }
    }

    /// Pass `call` to the next middleware, or to the invoker at the end.
    pub fn run(self, call: RpcCall) -> BoxFuture<'a, Result<RawResponse, Status>> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((head, rest)) => {
                    head.call(
                        call,
                        Next {
                            chain: rest,
                            invoker: self.invoker,
                        },
                    )
                    .await
                }
                None => {
                    let request = RawRequest {
                        method: call.method,
                        body: call.body,
                        metadata: call.metadata,
                        timeout: call.ctx.remaining(),
                    };
                    call.ctx.run(self.invoker.unary(request)).await
                }
            }
        })
    }
}

/// Cache of the backend-issued auth token, shared by every connection of a client.
#[derive(Debug, Default)]
pub struct AuthTokenStore {
    token: RwLock<Option<String>>,
}

impl AuthTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }

    /// Store `token` if it differs from the cached one. Returns true on change.
    pub fn set_if_changed(&self, token: &str) -> bool {
        if token.is_empty() || self.get().as_deref() == Some(token) {
            return false;
        }
        match self.token.write() {
            Ok(mut guard) => {
                if guard.is_some() {
                    debug!("auth token rotated by server");
                }
                *guard = Some(token.to_string());
                true
            }
            Err(_) => false,
        }
    }
}

/// Attaches client identity and credentials; harvests the auth token.
pub struct AuthMiddleware {
    headers: Vec<(&'static str, AsciiMetadataValue)>,
    tokens: Arc<AuthTokenStore>,
}

impl fmt::Debug for AuthMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMiddleware").finish_non_exhaustive()
    }
}

impl AuthMiddleware {
    /// Build from a profile. Fails if a credential is not a valid header value.
    pub fn new(profile: &Profile, tokens: Arc<AuthTokenStore>) -> Result<Self, Status> {
        let client_type = modal_protocol::api::ClientType::Libmodal as i32;
        let headers = vec![
            (CLIENT_TYPE_HEADER, ascii(&client_type.to_string())?),
            (CLIENT_VERSION_HEADER, ascii(CLIENT_VERSION)?),
            (TOKEN_ID_HEADER, ascii(&profile.token_id)?),
            (TOKEN_SECRET_HEADER, ascii(&profile.token_secret)?),
        ];
        Ok(Self { headers, tokens })
    }

    /// Attach identity, credentials and the cached auth token.
    pub fn attach(&self, metadata: &mut MetadataMap) {
        for (key, value) in &self.headers {
            metadata.insert(*key, value.clone());
        }
        if let Some(token) = self.tokens.get() {
            match AsciiMetadataValue::try_from(token.as_str()) {
                Ok(value) => {
                    metadata.insert(AUTH_TOKEN_HEADER, value);
                }
                Err(_) => warn!("cached auth token is not a valid header value"),
            }
        }
    }

    /// Cache the token from `primary` if present, otherwise from `fallback`.
    pub fn harvest(&self, primary: &MetadataMap, fallback: &MetadataMap) {
        let token = primary
            .get(AUTH_TOKEN_HEADER)
            .or_else(|| fallback.get(AUTH_TOKEN_HEADER))
            .and_then(|v| v.to_str().ok());
        if let Some(token) = token {
            self.tokens.set_if_changed(token);
        }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn call(&self, mut call: RpcCall, next: Next<'_>) -> Result<RawResponse, Status> {
        self.attach(&mut call.metadata);
        let result = next.run(call).await;
        match &result {
            Ok(response) => self.harvest(&response.headers, &response.trailers),
            Err(status) => self.harvest(status.metadata(), &MetadataMap::new()),
        }
        result
    }
}

/// Retries transient failures with exponential backoff.
#[derive(Debug, Default)]
pub struct RetryMiddleware;

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn call(&self, call: RpcCall, next: Next<'_>) -> Result<RawResponse, Status> {
        let policy = RetryPolicy::from_options(&call.options);
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let mut attempt_call = call.clone();
            attempt_call
                .metadata
                .insert(IDEMPOTENCY_KEY_HEADER, ascii(&idempotency_key)?);
            attempt_call
                .metadata
                .insert(RETRY_ATTEMPT_HEADER, ascii(&attempt.to_string())?);
            let elapsed = format!("{:.3}", started.elapsed().as_secs_f64());
            attempt_call
                .metadata
                .insert(RETRY_DELAY_HEADER, ascii(&elapsed)?);

            let status = match next.run(attempt_call).await {
                Ok(response) => return Ok(response),
                Err(status) => status,
            };

            if attempt >= policy.max_retries || !policy.should_retry(status.code()) {
                return Err(status);
            }
            // An RPC cut short by the caller's own cancellation is not transient.
            if let Some(done) = call.ctx.err() {
                return Err(done);
            }

            attempt += 1;
            let delay = policy.delay_for_attempt(attempt);
            debug!(
                method = call.method,
                attempt,
                code = ?status.code(),
                delay_ms = delay.as_millis() as u64,
                "retrying RPC"
            );
            call.ctx.sleep(delay).await?;
        }
    }
}

/// Imposes the per-call timeout on each attempt.
#[derive(Debug, Default)]
pub struct TimeoutMiddleware;

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn call(&self, mut call: RpcCall, next: Next<'_>) -> Result<RawResponse, Status> {
        if let Some(timeout) = call.options.timeout {
            call.ctx = call.ctx.with_timeout(timeout);
        }
        next.run(call).await
    }
}

/// The standard chain: auth, retry, timeout (outermost first).
pub fn default_chain(auth: Arc<AuthMiddleware>) -> Arc<[Arc<dyn Middleware>]> {
    let chain: Vec<Arc<dyn Middleware>> =
        vec![auth, Arc::new(RetryMiddleware), Arc::new(TimeoutMiddleware)];
    chain.into()
}

fn ascii(value: &str) -> Result<AsciiMetadataValue, Status> {
    AsciiMetadataValue::try_from(value)
        .map_err(|_| Status::invalid_argument(format!("invalid header value: {value:?}")))
}
