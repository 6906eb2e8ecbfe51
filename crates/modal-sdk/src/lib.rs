// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Modal SDK - client for running functions and sandboxes on Modal.
//!
//! This crate talks to the Modal control plane over gRPC (via
//! `modal-protocol`) and exposes typed handles for the remote-invocation
//! surface of the platform.
//!
//! # Features
//!
//! - **Functions**: call deployed functions synchronously or spawn them and
//!   collect the output later, on the control plane or an input plane
//! - **Classes**: bind constructor parameters and call methods
//! - **Large payloads**: arguments and results of 2 MiB or more travel
//!   through pre-signed blob URLs
//! - **Queues**: named and ephemeral distributed queues with partitions
//! - **Sandboxes**: create containers, exec processes, stream stdin/stdout
//!   with automatic reconnection
//! - **Transport**: auth token caching, retries with idempotency keys and
//!   per-call timeouts on every RPC
//!
//! # Quick Start
//!
//! ```ignore
//! use modal_sdk::{Client, Function, Kwargs, Value};
//!
//! #[tokio::main]
//! async fn main() -> modal_sdk::Result<()> {
//!     let client = Client::from_env()?;
//!
//!     let echo = Function::lookup(&client, "libmodal-test-support", "echo_string", None).await?;
//!     let output = echo
//!         .remote(vec![Value::String("hello".into())], Kwargs::new())
//!         .await?;
//!     println!("{:?}", output.into_value());
//!
//!     // Fire and forget, then collect
//!     let call = echo.spawn(vec![Value::String("later".into())], Kwargs::new()).await?;
//!     let output = call.get(Some(std::time::Duration::from_secs(60))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Sandboxes
//!
//! ```ignore
//! use modal_sdk::{ExecOptions, Sandbox, SandboxOptions};
//!
//! let sandbox = Sandbox::create(&client, &app_id, &image_id, SandboxOptions {
//!     command: vec!["cat".into()],
//!     ..Default::default()
//! }).await?;
//!
//! sandbox.stdin.write("this is input that should be mirrored by cat").await?;
//! sandbox.stdin.close().await?;
//! let echoed = sandbox.stdout.read_text().await?;
//!
//! let process = sandbox.exec(vec!["echo".into(), "hi".into()], ExecOptions::default()).await?;
//! let exit_code = process.wait().await?;
//! sandbox.terminate().await?;
//! ```
//!
//! # Cancellation and Deadlines
//!
//! Every handle carries a [`Context`]. Cancelling it, or letting its
//! deadline pass, aborts in-flight RPCs, backoff sleeps and stream pumps
//! of everything derived from it:
//!
//! ```ignore
//! let ctx = client.context().with_timeout(Duration::from_secs(30));
//! let echo = echo.with_context(ctx.clone());
//! ctx.cancel(); // any pending remote() now fails with a CANCELLED status
//! ```
//!
//! # Configuration
//!
//! ## Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `MODAL_TOKEN_ID` | Yes | - | Token id |
//! | `MODAL_TOKEN_SECRET` | Yes | - | Token secret |
//! | `MODAL_SERVER_URL` | No | `https://api.modal.com:443` | Control plane URL |
//! | `MODAL_ENVIRONMENT` | No | - | Default environment name |
//!
//! ## Programmatic Configuration
//!
//! ```ignore
//! use modal_sdk::{Client, Profile};
//!
//! let profile = Profile::new("ak-...", "as-...")
//!     .with_server_url("http://localhost:8889")
//!     .with_environment("staging");
//! let client = Client::new(profile)?;
//! modal_sdk::init_with(client.clone())?;
//! ```

mod blob;
mod client;
mod cls;
mod config;
mod context;
mod error;
mod function;
mod function_call;
mod invocation;
mod middleware;
mod output;
mod params;
mod pickle;
mod queue;
mod registry;
mod retry;
mod sandbox;
mod streams;
mod transport;

// Client and configuration
pub use client::{Client, Connector, GrpcConnector};
pub use config::{DEFAULT_SERVER_URL, Profile};
pub use context::Context;
pub use error::{Result, SdkError};
pub use retry::{CallOptions, DEFAULT_RETRYABLE_CODES, RetryPolicy, is_retryable_code};

// Functions and classes
pub use cls::{Cls, ClsInstance};
pub use function::{Function, MAX_SYSTEM_RETRIES};
pub use function_call::FunctionCall;
pub use invocation::OUTPUTS_TIMEOUT;
pub use output::Output;
pub use params::{ParamValue, encode_parameter_set};

// Payloads
pub use blob::{MAX_OBJECT_SIZE_BYTES, digests, needs_upload};
pub use pickle::{
    HashableValue, Kwargs, Value, deserialize, from_value, serialize, serialize_args, to_value,
};

// Queues
pub use queue::{
    Queue, QueueClearOptions, QueueGetOptions, QueueIterateOptions, QueueLenOptions,
    QueuePutOptions, validate_partition_key,
};

// Sandboxes and streams
pub use sandbox::{
    ContainerProcess, ExecOptions, Sandbox, SandboxOptions, StdioBehavior, TERMINATED_EXIT_CODE,
    TIMEOUT_EXIT_CODE, Tunnel,
};
pub use streams::{OutputCursor, OutputStream, STREAM_RETRY_BUDGET, StdinWriter};

// Process-wide default client
pub use registry::{global, init, init_with};

// Re-export the wire layer for custom connectors
pub use modal_protocol::{ChannelConfig, RpcInvoker};
