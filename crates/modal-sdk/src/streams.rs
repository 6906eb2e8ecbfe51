// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Byte streams bridged over chunked RPCs.
//!
//! ```text
//!   StdinWriter::write ──► SandboxStdinWrite / ContainerExecPutInput
//!                          (one RPC per write, index 1, 2, 3, ... then eof)
//!
//!   SandboxGetLogs / ContainerExecGetOutput ──► pump task ──► mpsc ──► OutputStream
//!   (server streaming, resumed from the last       │                  (AsyncRead)
//!    cursor after every disconnect)                └─ shared budget of
//!                                                     STREAM_RETRY_BUDGET errors
//! ```

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use modal_protocol::api::{self, FileDescriptor};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tonic::Status;
use tracing::{debug, warn};

use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, SdkError};
use crate::retry::{RetryPolicy, is_retryable_code};

/// Transient read errors tolerated over the whole lifetime of one stream.
pub const STREAM_RETRY_BUDGET: u32 = 10;

/// How long a single log/output read call may stay open server-side.
const READ_CALL_TIMEOUT_SECS: f32 = 55.0;

const PIPE_CAPACITY: usize = 64;

// ============================================================================
// Write side
// ============================================================================

#[derive(Debug, Clone)]
enum StdinTarget {
    Sandbox { sandbox_id: String },
    Exec { exec_id: String },
}

#[derive(Debug)]
struct StdinState {
    // index the next write or eof will carry
    next_index: u64,
    closed: bool,
}

/// Writable end of a remote stdin.
///
/// Every write is one RPC tagged with the next sequence index. The index is
/// allocated and advanced under a lock held for the duration of the RPC, so
/// concurrent writers are serialised and never share an index.
#[derive(Debug, Clone)]
pub struct StdinWriter {
    client: Client,
    ctx: Context,
    target: StdinTarget,
    state: Arc<Mutex<StdinState>>,
}

impl StdinWriter {
    fn new(client: &Client, ctx: &Context, target: StdinTarget) -> Self {
        Self {
            client: client.clone(),
            ctx: ctx.clone(),
            target,
            state: Arc::new(Mutex::new(StdinState {
                next_index: 1,
                closed: false,
            })),
        }
    }

    pub(crate) fn for_sandbox(client: &Client, ctx: &Context, sandbox_id: &str) -> Self {
        Self::new(
            client,
            ctx,
            StdinTarget::Sandbox {
                sandbox_id: sandbox_id.to_string(),
            },
        )
    }

    pub(crate) fn for_exec(client: &Client, ctx: &Context, exec_id: &str) -> Self {
        Self::new(
            client,
            ctx,
            StdinTarget::Exec {
                exec_id: exec_id.to_string(),
            },
        )
    }

    /// Send `data` as the next chunk.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SdkError::Invalid("stdin is closed".to_string()));
        }
        self.send(state.next_index, data, false).await?;
        state.next_index += 1;
        Ok(())
    }

    /// Signal end of input. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        self.send(state.next_index, Bytes::new(), true).await?;
        state.next_index += 1;
        state.closed = true;
        debug!(target = ?self.target, "stdin closed");
        Ok(())
    }

    async fn send(&self, index: u64, data: Bytes, eof: bool) -> Result<()> {
        match &self.target {
            StdinTarget::Sandbox { sandbox_id } => {
                let index = u32::try_from(index)
                    .map_err(|_| SdkError::Invalid("stdin index overflow".to_string()))?;
                self.client
                    .control_plane()
                    .sandbox_stdin_write(
                        &self.ctx,
                        api::SandboxStdinWriteRequest {
                            sandbox_id: sandbox_id.clone(),
                            input: data.to_vec(),
                            index,
                            eof,
                        },
                    )
                    .await?;
            }
            StdinTarget::Exec { exec_id } => {
                self.client
                    .control_plane()
                    .container_exec_put_input(
                        &self.ctx,
                        api::ContainerExecPutInputRequest {
                            exec_id: exec_id.clone(),
                            input: Some(api::RuntimeInputMessage {
                                message: data.to_vec(),
                                message_index: index,
                                eof,
                            }),
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Read side
// ============================================================================

/// Forward-only position in a remote output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputCursor {
    /// Redis-style `"<ms>-<seq>"` entry id used by sandbox logs.
    EntryId(String),
    /// Integer batch index used by process output.
    BatchIndex(u64),
}

impl OutputCursor {
    /// Cursor before the first sandbox log entry.
    pub fn first_entry() -> Self {
        OutputCursor::EntryId("0-0".to_string())
    }

    /// Cursor before the first process output batch.
    pub fn first_batch() -> Self {
        OutputCursor::BatchIndex(0)
    }

    /// Move to `next` if it lies strictly after the current position.
    ///
    /// Returns `false` (and stays put) for positions already seen, which is
    /// how batches replayed after a reconnect are recognised.
    pub fn advance(&mut self, next: OutputCursor) -> bool {
        let ahead = match (&*self, &next) {
            (OutputCursor::BatchIndex(current), OutputCursor::BatchIndex(candidate)) => {
                candidate > current
            }
            (OutputCursor::EntryId(current), OutputCursor::EntryId(candidate)) => {
                match (parse_entry_id(current), parse_entry_id(candidate)) {
                    (Some(current), Some(candidate)) => candidate > current,
                    // Unparseable ids are opaque; trust the server's ordering.
                    _ => candidate != current,
                }
            }
            _ => false,
        };
        if ahead {
            *self = next;
        }
        ahead
    }
}

fn parse_entry_id(id: &str) -> Option<(u64, u64)> {
    let (millis, seq) = id.split_once('-')?;
    Some((millis.parse().ok()?, seq.parse().ok()?))
}

/// One batch of output read from the backend.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputBatch {
    /// Position after this batch, if the backend reported one.
    pub cursor: Option<OutputCursor>,
    pub chunks: Vec<Bytes>,
    /// No further output will follow.
    pub end: bool,
}

pub(crate) type BatchStream = BoxStream<'static, std::result::Result<OutputBatch, Status>>;

/// A resumable server-streaming output call.
#[async_trait]
pub(crate) trait BatchSource: Send + Sync + 'static {
    /// Open the call, resuming after `cursor`.
    async fn open(&self, cursor: &OutputCursor) -> std::result::Result<BatchStream, Status>;
}

/// Sandbox stdout/stderr via `SandboxGetLogs`.
pub(crate) struct SandboxLogs {
    pub client: Client,
    pub ctx: Context,
    pub sandbox_id: String,
    pub file_descriptor: FileDescriptor,
}

#[async_trait]
impl BatchSource for SandboxLogs {
    async fn open(&self, cursor: &OutputCursor) -> std::result::Result<BatchStream, Status> {
        let last_entry_id = match cursor {
            OutputCursor::EntryId(id) => id.clone(),
            OutputCursor::BatchIndex(_) => {
                return Err(Status::invalid_argument("sandbox logs use entry-id cursors"));
            }
        };
        let stream = self
            .client
            .control_plane()
            .sandbox_get_logs(
                &self.ctx,
                api::SandboxGetLogsRequest {
                    sandbox_id: self.sandbox_id.clone(),
                    file_descriptor: self.file_descriptor as i32,
                    timeout: READ_CALL_TIMEOUT_SECS,
                    last_entry_id,
                },
            )
            .await?;
        Ok(stream
            .map(|batch| {
                batch.map(|batch| OutputBatch {
                    cursor: (!batch.entry_id.is_empty())
                        .then(|| OutputCursor::EntryId(batch.entry_id.clone())),
                    chunks: batch
                        .items
                        .into_iter()
                        .map(|item| Bytes::from(item.data))
                        .collect(),
                    end: batch.eof,
                })
            })
            .boxed())
    }
}

/// Process stdout/stderr via `ContainerExecGetOutput`.
pub(crate) struct ExecOutput {
    pub client: Client,
    pub ctx: Context,
    pub exec_id: String,
    pub file_descriptor: FileDescriptor,
}

#[async_trait]
impl BatchSource for ExecOutput {
    async fn open(&self, cursor: &OutputCursor) -> std::result::Result<BatchStream, Status> {
        let last_batch_index = match cursor {
            OutputCursor::BatchIndex(index) => *index,
            OutputCursor::EntryId(_) => {
                return Err(Status::invalid_argument("process output uses batch-index cursors"));
            }
        };
        let stream = self
            .client
            .control_plane()
            .container_exec_get_output(
                &self.ctx,
                api::ContainerExecGetOutputRequest {
                    exec_id: self.exec_id.clone(),
                    timeout: READ_CALL_TIMEOUT_SECS,
                    last_batch_index,
                    file_descriptor: self.file_descriptor as i32,
                    get_raw_bytes: true,
                },
            )
            .await?;
        Ok(stream
            .map(|batch| {
                batch.map(|batch| OutputBatch {
                    cursor: Some(OutputCursor::BatchIndex(batch.batch_index)),
                    chunks: batch
                        .items
                        .into_iter()
                        .map(|item| Bytes::from(item.message_bytes))
                        .collect(),
                    end: batch.exit_code.is_some(),
                })
            })
            .boxed())
    }
}

/// Readable end of a remote output stream.
///
/// Bytes arrive in generation order. If the producer fails permanently, the
/// error is returned by `read` once every byte received before it has been
/// consumed.
pub struct OutputStream {
    reader: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream").finish_non_exhaustive()
    }
}

impl OutputStream {
    fn from_receiver(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            reader: StreamReader::new(ReceiverStream::new(rx)),
        }
    }

    /// A stream that is already at end of file.
    pub fn empty() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self::from_receiver(rx)
    }

    /// Start reading `source` from `cursor` in a background task.
    pub(crate) fn spawn<S: BatchSource>(source: S, cursor: OutputCursor, ctx: Context) -> Self {
        let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
        tokio::spawn(pump(source, cursor, tx, ctx));
        Self::from_receiver(rx)
    }

    /// Read `source` to completion and discard it.
    pub(crate) fn drain<S: BatchSource>(source: S, cursor: OutputCursor, ctx: Context) -> Self {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        tokio::spawn(pump(source, cursor, tx, ctx));
        Self::empty()
    }

    /// Read everything until end of stream.
    pub async fn read_to_end_bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Read everything until end of stream as UTF-8 text.
    pub async fn read_text(&mut self) -> io::Result<String> {
        let bytes = self.read_to_end_bytes().await?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl AsyncRead for OutputStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

fn stream_error(status: Status) -> io::Error {
    io::Error::other(SdkError::Rpc(status))
}

/// Copy batches from `source` into `tx`, reconnecting from the last cursor.
///
/// A call that ends without an end-of-stream batch (the backend closes read
/// calls periodically) is reopened for free; retryable errors spend the
/// shared budget. If the receiver goes away the stream is still read to the
/// end so the remote side never blocks on an absent reader.
async fn pump<S: BatchSource>(
    source: S,
    mut cursor: OutputCursor,
    tx: mpsc::Sender<io::Result<Bytes>>,
    ctx: Context,
) {
    let backoff = RetryPolicy::default();
    let mut retries_used = 0u32;
    let mut receiver_open = true;

    let failure = 'outer: loop {
        let mut batches = match ctx.run(source.open(&cursor)).await {
            Ok(batches) => batches,
            Err(status) => {
                if !spend_retry(&status, &mut retries_used) {
                    break 'outer status;
                }
                if let Err(status) = ctx.sleep(backoff.delay_for_attempt(retries_used)).await {
                    break 'outer status;
                }
                continue;
            }
        };

        loop {
            let next = tokio::select! {
                status = ctx.done() => break 'outer status,
                next = batches.next() => next,
            };

            match next {
                None => {
                    debug!(?cursor, "output call ended, reopening");
                    continue 'outer;
                }
                Some(Err(status)) => {
                    if !spend_retry(&status, &mut retries_used) {
                        break 'outer status;
                    }
                    continue 'outer;
                }
                Some(Ok(batch)) => {
                    let fresh = match batch.cursor {
                        Some(next) => cursor.advance(next),
                        None => true,
                    };
                    if fresh {
                        for chunk in batch.chunks.into_iter().filter(|c| !c.is_empty()) {
                            if receiver_open && tx.send(Ok(chunk)).await.is_err() {
                                receiver_open = false;
                            }
                        }
                    }
                    if batch.end {
                        debug!(?cursor, "output stream finished");
                        return;
                    }
                }
            }
        }
    };

    debug!(code = ?failure.code(), "output stream failed");
    if receiver_open {
        let _ = tx.send(Err(stream_error(failure))).await;
    }
}

fn spend_retry(status: &Status, retries_used: &mut u32) -> bool {
    if !is_retryable_code(status.code()) || *retries_used >= STREAM_RETRY_BUDGET {
        return false;
    }
    *retries_used += 1;
    warn!(
        code = ?status.code(),
        message = status.message(),
        retries_left = STREAM_RETRY_BUDGET - *retries_used,
        "output stream error, reconnecting"
    );
    true
}
