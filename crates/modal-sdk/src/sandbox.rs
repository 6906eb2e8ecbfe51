// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandboxes and the processes executed inside them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use modal_protocol::api::{self, FileDescriptor, GenericStatus};
use tracing::{debug, info, instrument};

use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, SdkError};
use crate::streams::{ExecOutput, OutputCursor, OutputStream, SandboxLogs, StdinWriter};

/// Server-side wait per `SandboxWait` / `ContainerExecWait` call.
const WAIT_TIMEOUT_SECS: f32 = 55.0;

/// Exit code reported for a sandbox that hit its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported for a terminated sandbox.
pub const TERMINATED_EXIT_CODE: i32 = 137;

/// Parameters for [`Sandbox::create`].
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Entrypoint command and arguments.
    pub command: Vec<String>,
    /// Maximum lifetime (`None` = backend default).
    pub timeout: Option<Duration>,
    /// CPU cores to reserve, fractional values allowed.
    pub cpu: Option<f64>,
    /// Memory to reserve in MiB.
    pub memory_mb: Option<u32>,
}

/// What to do with a process's output stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioBehavior {
    /// Expose the stream to the caller.
    #[default]
    Pipe,
    /// Read and discard the stream.
    Ignore,
}

/// Parameters for [`Sandbox::exec`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub stdout: StdioBehavior,
    pub stderr: StdioBehavior,
    pub workdir: Option<String>,
    /// Kill the process after this long (`None` = no limit).
    pub timeout: Option<Duration>,
    /// Secrets whose environment variables are injected into the process.
    pub secret_ids: Vec<String>,
}

/// A port forwarded out of a running sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub host: String,
    pub port: u32,
    pub unencrypted_host: Option<String>,
    pub unencrypted_port: Option<u32>,
}

impl Tunnel {
    /// Public HTTPS URL of the forwarded port.
    pub fn url(&self) -> String {
        if self.port == 443 {
            format!("https://{}", self.host)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }

    pub fn tls_socket(&self) -> (&str, u32) {
        (&self.host, self.port)
    }

    /// Plain TCP endpoint, if the tunnel was configured with one.
    pub fn tcp_socket(&self) -> Result<(&str, u32)> {
        match (&self.unencrypted_host, self.unencrypted_port) {
            (Some(host), Some(port)) if !host.is_empty() && port != 0 => Ok((host, port)),
            _ => Err(SdkError::Invalid(
                "this tunnel is not configured for unencrypted TCP".to_string(),
            )),
        }
    }
}

impl From<api::TunnelData> for Tunnel {
    fn from(data: api::TunnelData) -> Self {
        Self {
            host: data.host,
            port: data.port,
            unencrypted_host: data.unencrypted_host,
            unencrypted_port: data.unencrypted_port,
        }
    }
}

/// Exit code for a finished sandbox, `None` while it is still running.
pub(crate) fn exit_code(result: Option<&api::GenericResult>) -> Option<i32> {
    let result = result?;
    match result.status() {
        GenericStatus::Unspecified => None,
        GenericStatus::Timeout => Some(TIMEOUT_EXIT_CODE),
        GenericStatus::Terminated => Some(TERMINATED_EXIT_CODE),
        _ => Some(result.exitcode),
    }
}

/// A running (or finished) sandbox.
///
/// `stdout` and `stderr` start streaming as soon as the handle exists.
pub struct Sandbox {
    client: Client,
    ctx: Context,
    sandbox_id: String,
    task_id: Mutex<Option<String>>,
    tunnels: Mutex<Option<HashMap<u32, Tunnel>>>,
    pub stdin: StdinWriter,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("sandbox_id", &self.sandbox_id)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    fn attach(client: &Client, sandbox_id: String) -> Self {
        let ctx = client.context().clone();
        let logs = |file_descriptor| SandboxLogs {
            client: client.clone(),
            ctx: ctx.clone(),
            sandbox_id: sandbox_id.clone(),
            file_descriptor,
        };
        let stdout = OutputStream::spawn(
            logs(FileDescriptor::Stdout),
            OutputCursor::first_entry(),
            ctx.clone(),
        );
        let stderr = OutputStream::spawn(
            logs(FileDescriptor::Stderr),
            OutputCursor::first_entry(),
            ctx.clone(),
        );
        Self {
            stdin: StdinWriter::for_sandbox(client, &ctx, &sandbox_id),
            stdout,
            stderr,
            client: client.clone(),
            ctx,
            sandbox_id,
            task_id: Mutex::new(None),
            tunnels: Mutex::new(None),
        }
    }

    /// Create a sandbox in app `app_id` running image `image_id`.
    #[instrument(skip(client, options))]
    pub async fn create(
        client: &Client,
        app_id: &str,
        image_id: &str,
        options: SandboxOptions,
    ) -> Result<Self> {
        let resources = (options.cpu.is_some() || options.memory_mb.is_some()).then(|| {
            api::Resources {
                milli_cpu: options.cpu.map_or(0, |cpu| (cpu * 1000.0).round() as u32),
                memory_mb: options.memory_mb.unwrap_or(0),
            }
        });
        let timeout_secs = options
            .timeout
            .map_or(0, |t| u32::try_from(t.as_secs()).unwrap_or(u32::MAX));

        let response = client
            .control_plane()
            .sandbox_create(
                client.context(),
                api::SandboxCreateRequest {
                    app_id: app_id.to_string(),
                    definition: Some(api::SandboxDefinition {
                        entrypoint_args: options.command,
                        image_id: image_id.to_string(),
                        resources,
                        timeout_secs,
                        ..Default::default()
                    }),
                    environment_name: client.environment_name(None),
                },
            )
            .await?;

        info!(sandbox_id = %response.sandbox_id, "sandbox created");
        Ok(Self::attach(client, response.sandbox_id))
    }

    /// Attach to an existing sandbox.
    #[instrument(skip(client))]
    pub async fn from_id(client: &Client, sandbox_id: &str) -> Result<Self> {
        client
            .control_plane()
            .sandbox_wait(
                client.context(),
                api::SandboxWaitRequest {
                    sandbox_id: sandbox_id.to_string(),
                    timeout: 0.0,
                },
            )
            .await
            .map_err(|status| {
                SdkError::not_found_or(status, || {
                    format!("sandbox with id '{sandbox_id}' not found")
                })
            })?;
        Ok(Self::attach(client, sandbox_id.to_string()))
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Block until the sandbox exits and return its exit code.
    #[instrument(skip(self), fields(sandbox_id = %self.sandbox_id))]
    pub async fn wait(&self) -> Result<i32> {
        loop {
            let response = self
                .client
                .control_plane()
                .sandbox_wait(
                    &self.ctx,
                    api::SandboxWaitRequest {
                        sandbox_id: self.sandbox_id.clone(),
                        timeout: WAIT_TIMEOUT_SECS,
                    },
                )
                .await?;
            if let Some(result) = response.result {
                let code = exit_code(Some(&result)).unwrap_or(0);
                debug!(exit_code = code, "sandbox finished");
                return Ok(code);
            }
        }
    }

    /// Exit code if the sandbox has finished, `None` while it runs.
    pub async fn poll(&self) -> Result<Option<i32>> {
        let response = self
            .client
            .control_plane()
            .sandbox_wait(
                &self.ctx,
                api::SandboxWaitRequest {
                    sandbox_id: self.sandbox_id.clone(),
                    timeout: 0.0,
                },
            )
            .await?;
        Ok(exit_code(response.result.as_ref()))
    }

    /// Stop the sandbox.
    #[instrument(skip(self), fields(sandbox_id = %self.sandbox_id))]
    pub async fn terminate(&self) -> Result<()> {
        self.client
            .control_plane()
            .sandbox_terminate(
                &self.ctx,
                api::SandboxTerminateRequest {
                    sandbox_id: self.sandbox_id.clone(),
                },
            )
            .await?;
        if let Ok(mut task_id) = self.task_id.lock() {
            *task_id = None;
        }
        info!("sandbox terminated");
        Ok(())
    }

    /// Forwarded ports keyed by container port, waiting up to `timeout` for
    /// them to become available. The result is cached.
    #[instrument(skip(self), fields(sandbox_id = %self.sandbox_id))]
    pub async fn tunnels(&self, timeout: Duration) -> Result<HashMap<u32, Tunnel>> {
        if let Some(cached) = self.cached(&self.tunnels)? {
            return Ok(cached);
        }

        let response = self
            .client
            .control_plane()
            .sandbox_get_tunnels(
                &self.ctx,
                api::SandboxGetTunnelsRequest {
                    sandbox_id: self.sandbox_id.clone(),
                    timeout: timeout.as_secs_f32(),
                },
            )
            .await?;

        if response
            .result
            .as_ref()
            .is_some_and(|r| r.status() == GenericStatus::Timeout)
        {
            return Err(SdkError::SandboxTimeout(
                "tunnels were not available in time".to_string(),
            ));
        }

        let tunnels: HashMap<u32, Tunnel> = response
            .tunnels
            .into_iter()
            .map(|data| (data.container_port, Tunnel::from(data)))
            .collect();
        *self.tunnels.lock().map_err(|_| poisoned())? = Some(tunnels.clone());
        Ok(tunnels)
    }

    /// Snapshot the sandbox filesystem; returns the id of the new image.
    #[instrument(skip(self), fields(sandbox_id = %self.sandbox_id))]
    pub async fn snapshot_filesystem(&self, timeout: Duration) -> Result<String> {
        let response = self
            .client
            .control_plane()
            .sandbox_snapshot_fs(
                &self.ctx,
                api::SandboxSnapshotFsRequest {
                    sandbox_id: self.sandbox_id.clone(),
                    timeout: timeout.as_secs_f32(),
                },
            )
            .await?;

        if let Some(result) = &response.result
            && result.status() != GenericStatus::Success
        {
            return Err(SdkError::Execution(format!(
                "sandbox snapshot failed: {}",
                result.exception
            )));
        }
        if response.image_id.is_empty() {
            return Err(SdkError::Execution(
                "sandbox snapshot response missing image id".to_string(),
            ));
        }
        info!(image_id = %response.image_id, "filesystem snapshot taken");
        Ok(response.image_id)
    }

    /// Run `command` inside the sandbox.
    #[instrument(skip(self, options), fields(sandbox_id = %self.sandbox_id))]
    pub async fn exec(
        &self,
        command: Vec<String>,
        options: ExecOptions,
    ) -> Result<ContainerProcess> {
        let task_id = self.ensure_task_id().await?;
        let timeout_secs = options
            .timeout
            .map_or(0, |t| u32::try_from(t.as_secs()).unwrap_or(u32::MAX));

        let response = self
            .client
            .control_plane()
            .container_exec(
                &self.ctx,
                api::ContainerExecRequest {
                    task_id,
                    command,
                    terminate_container_on_exit: false,
                    timeout_secs,
                    workdir: options.workdir.clone(),
                    secret_ids: options.secret_ids.clone(),
                },
            )
            .await?;

        debug!(exec_id = %response.exec_id, "process started");
        Ok(ContainerProcess::attach(
            &self.client,
            &self.ctx,
            response.exec_id,
            &options,
        ))
    }

    async fn ensure_task_id(&self) -> Result<String> {
        if let Some(task_id) = self.cached(&self.task_id)? {
            return Ok(task_id);
        }

        let response = self
            .client
            .control_plane()
            .sandbox_get_task_id(
                &self.ctx,
                api::SandboxGetTaskIdRequest {
                    sandbox_id: self.sandbox_id.clone(),
                    timeout: None,
                },
            )
            .await?;

        let task_id = response.task_id.filter(|id| !id.is_empty()).ok_or_else(|| {
            SdkError::Execution(format!(
                "sandbox {} does not have a task id, it may not be running",
                self.sandbox_id
            ))
        })?;
        if let Some(result) = response.task_result {
            return Err(SdkError::Execution(format!(
                "sandbox {} has already completed with status {:?}",
                self.sandbox_id,
                result.status()
            )));
        }

        *self.task_id.lock().map_err(|_| poisoned())? = Some(task_id.clone());
        Ok(task_id)
    }

    fn cached<T: Clone>(&self, slot: &Mutex<Option<T>>) -> Result<Option<T>> {
        Ok(slot.lock().map_err(|_| poisoned())?.clone())
    }
}

fn poisoned() -> SdkError {
    SdkError::Execution("sandbox state lock poisoned".to_string())
}

/// A process started with [`Sandbox::exec`].
pub struct ContainerProcess {
    client: Client,
    ctx: Context,
    exec_id: String,
    pub stdin: StdinWriter,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

impl fmt::Debug for ContainerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerProcess")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

impl ContainerProcess {
    fn attach(client: &Client, ctx: &Context, exec_id: String, options: &ExecOptions) -> Self {
        let output = |file_descriptor, behavior| {
            let source = ExecOutput {
                client: client.clone(),
                ctx: ctx.clone(),
                exec_id: exec_id.clone(),
                file_descriptor,
            };
            match behavior {
                StdioBehavior::Pipe => {
                    OutputStream::spawn(source, OutputCursor::first_batch(), ctx.clone())
                }
                StdioBehavior::Ignore => {
                    OutputStream::drain(source, OutputCursor::first_batch(), ctx.clone())
                }
            }
        };

        Self {
            stdin: StdinWriter::for_exec(client, ctx, &exec_id),
            stdout: output(FileDescriptor::Stdout, options.stdout),
            stderr: output(FileDescriptor::Stderr, options.stderr),
            client: client.clone(),
            ctx: ctx.clone(),
            exec_id,
        }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// Block until the process exits and return its exit code.
    #[instrument(skip(self), fields(exec_id = %self.exec_id))]
    pub async fn wait(&self) -> Result<i32> {
        loop {
            let response = self
                .client
                .control_plane()
                .container_exec_wait(
                    &self.ctx,
                    api::ContainerExecWaitRequest {
                        exec_id: self.exec_id.clone(),
                        timeout: WAIT_TIMEOUT_SECS,
                    },
                )
                .await?;
            if response.completed {
                return Ok(response.exit_code.unwrap_or(0));
            }
        }
    }
}
