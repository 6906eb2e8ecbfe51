// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed FIFO queues.
//!
//! Values are pickled. A queue has a default partition plus any number of
//! named partitions (keys of 1 to 64 bytes), each with its own TTL.

use std::collections::VecDeque;
use std::time::Duration;

use futures::Stream;
use futures::stream;
use modal_protocol::api::{self, DeploymentNamespace, ObjectCreationType};
use tokio::time::Instant;
use tonic::Code;
use tracing::{debug, info, instrument, warn};

use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, SdkError};
use crate::pickle::{self, Value};

/// Interval between heartbeats keeping an ephemeral queue alive.
pub const EPHEMERAL_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

const GET_POLL_TIMEOUT: Duration = Duration::from_secs(50);
const ITERATE_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_PUT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_PUT_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_PARTITION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_PARTITION_KEY_LEN: usize = 64;

/// Options for [`Queue::get`] and [`Queue::get_many`].
#[derive(Debug, Clone, Default)]
pub struct QueueGetOptions {
    /// Give up after this long (`None` waits indefinitely).
    pub timeout: Option<Duration>,
    /// Partition to read from ("" is the default partition).
    pub partition: String,
}

/// Options for [`Queue::put`] and [`Queue::put_many`].
#[derive(Debug, Clone, Default)]
pub struct QueuePutOptions {
    /// Give up waiting for space after this long (`None` waits indefinitely).
    pub timeout: Option<Duration>,
    pub partition: String,
    /// TTL of the partition (default 24 hours).
    pub partition_ttl: Option<Duration>,
}

/// Options for [`Queue::len`].
#[derive(Debug, Clone, Default)]
pub struct QueueLenOptions {
    pub partition: String,
    /// Count across all partitions; requires an empty `partition`.
    pub total: bool,
}

/// Options for [`Queue::clear`].
#[derive(Debug, Clone, Default)]
pub struct QueueClearOptions {
    pub partition: String,
    /// Clear every partition; requires an empty `partition`.
    pub all: bool,
}

/// Options for [`Queue::iterate`].
#[derive(Debug, Clone, Default)]
pub struct QueueIterateOptions {
    /// Stop once no new item has arrived for this long.
    pub item_poll_timeout: Duration,
    pub partition: String,
}

/// Validate a partition key; the empty string selects the default partition.
pub fn validate_partition_key(partition: &str) -> Result<Vec<u8>> {
    if partition.len() > MAX_PARTITION_KEY_LEN {
        return Err(SdkError::Invalid(
            "queue partition key must be 1-64 bytes long".to_string(),
        ));
    }
    Ok(partition.as_bytes().to_vec())
}

/// Handle to a queue.
#[derive(Debug, Clone)]
pub struct Queue {
    client: Client,
    ctx: Context,
    queue_id: String,
    // cancels the heartbeat task of an ephemeral queue
    heartbeat: Option<Context>,
}

impl Queue {
    /// Create a nameless queue that lives until [`close_ephemeral`](Self::close_ephemeral).
    #[instrument(skip(client))]
    pub async fn ephemeral(client: &Client, environment: Option<&str>) -> Result<Self> {
        let ctx = client.context().clone();
        let response = client
            .control_plane()
            .queue_get_or_create(
                &ctx,
                api::QueueGetOrCreateRequest {
                    object_creation_type: ObjectCreationType::Ephemeral as i32,
                    environment_name: client.environment_name(environment),
                    ..Default::default()
                },
            )
            .await?;

        let heartbeat = ctx.child();
        tokio::spawn(heartbeat_loop(
            client.clone(),
            heartbeat.clone(),
            response.queue_id.clone(),
        ));

        info!(queue_id = %response.queue_id, "ephemeral queue created");
        Ok(Self {
            client: client.clone(),
            ctx,
            queue_id: response.queue_id,
            heartbeat: Some(heartbeat),
        })
    }

    /// Stop keeping an ephemeral queue alive; the backend then discards it.
    pub fn close_ephemeral(&self) -> Result<()> {
        match &self.heartbeat {
            Some(heartbeat) => {
                heartbeat.cancel();
                Ok(())
            }
            None => Err(SdkError::Invalid(format!(
                "queue {} is not ephemeral",
                self.queue_id
            ))),
        }
    }

    /// Reference a named queue, optionally creating it.
    #[instrument(skip(client))]
    pub async fn lookup(
        client: &Client,
        name: &str,
        create_if_missing: bool,
        environment: Option<&str>,
    ) -> Result<Self> {
        let ctx = client.context().clone();
        let creation_type = if create_if_missing {
            ObjectCreationType::CreateIfMissing
        } else {
            ObjectCreationType::Unspecified
        };
        let response = client
            .control_plane()
            .queue_get_or_create(
                &ctx,
                api::QueueGetOrCreateRequest {
                    deployment_name: name.to_string(),
                    namespace: DeploymentNamespace::Workspace as i32,
                    environment_name: client.environment_name(environment),
                    object_creation_type: creation_type as i32,
                },
            )
            .await
            .map_err(|status| {
                SdkError::not_found_or(status, || format!("queue '{name}' not found"))
            })?;

        Ok(Self {
            client: client.clone(),
            ctx,
            queue_id: response.queue_id,
            heartbeat: None,
        })
    }

    /// Delete the named queue.
    #[instrument(skip(client))]
    pub async fn delete(client: &Client, name: &str, environment: Option<&str>) -> Result<()> {
        let queue = Self::lookup(client, name, false, environment).await?;
        client
            .control_plane()
            .queue_delete(
                &queue.ctx,
                api::QueueDeleteRequest {
                    queue_id: queue.queue_id.clone(),
                },
            )
            .await?;
        info!(queue_id = %queue.queue_id, "queue deleted");
        Ok(())
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Run subsequent calls under `ctx` instead of the client's root context.
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    /// Remove all items from one partition, or from all of them.
    #[instrument(skip(self), fields(queue_id = %self.queue_id))]
    pub async fn clear(&self, options: QueueClearOptions) -> Result<()> {
        if options.all && !options.partition.is_empty() {
            return Err(SdkError::Invalid(
                "partition must be empty when clearing all partitions".to_string(),
            ));
        }
        let partition_key = validate_partition_key(&options.partition)?;
        self.client
            .control_plane()
            .queue_clear(
                &self.ctx,
                api::QueueClearRequest {
                    queue_id: self.queue_id.clone(),
                    partition_key,
                    all_partitions: options.all,
                },
            )
            .await?;
        Ok(())
    }

    /// Remove and return one item, waiting for one to arrive.
    pub async fn get(&self, options: QueueGetOptions) -> Result<Value> {
        let mut values = self.get_values(1, options).await?;
        // get_values never returns an empty batch
        values
            .pop()
            .ok_or_else(|| {
                SdkError::QueueEmpty(format!("queue {} returned no values", self.queue_id))
            })
    }

    /// Remove and return up to `n` items, waiting for at least one.
    pub async fn get_many(&self, n: usize, options: QueueGetOptions) -> Result<Vec<Value>> {
        self.get_values(n, options).await
    }

    #[instrument(skip(self, options), fields(queue_id = %self.queue_id))]
    async fn get_values(&self, n: usize, options: QueueGetOptions) -> Result<Vec<Value>> {
        let partition_key = validate_partition_key(&options.partition)?;
        let n_values = i32::try_from(n)
            .map_err(|_| SdkError::Invalid(format!("cannot request {n} values at once")))?;

        let start = Instant::now();
        let mut poll_timeout = options
            .timeout
            .map_or(GET_POLL_TIMEOUT, |t| t.min(GET_POLL_TIMEOUT));

        loop {
            let response = self
                .client
                .control_plane()
                .queue_get(
                    &self.ctx,
                    api::QueueGetRequest {
                        queue_id: self.queue_id.clone(),
                        timeout: poll_timeout.as_secs_f32(),
                        n_values,
                        partition_key: partition_key.clone(),
                    },
                )
                .await?;

            if !response.values.is_empty() {
                return response
                    .values
                    .iter()
                    .map(|raw| pickle::deserialize(raw))
                    .collect();
            }

            if let Some(timeout) = options.timeout {
                let remaining = timeout.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    return Err(SdkError::QueueEmpty(format!(
                        "queue {} did not return values within {:.1}s",
                        self.queue_id,
                        timeout.as_secs_f64()
                    )));
                }
                poll_timeout = poll_timeout.min(remaining);
            }
        }
    }

    /// Append one item, waiting for space if the queue is full.
    pub async fn put(&self, value: Value, options: QueuePutOptions) -> Result<()> {
        self.put_many(vec![value], options).await
    }

    /// Append several items atomically, waiting for space if the queue is full.
    #[instrument(
        skip(self, values, options),
        fields(queue_id = %self.queue_id, count = values.len())
    )]
    pub async fn put_many(&self, values: Vec<Value>, options: QueuePutOptions) -> Result<()> {
        let partition_key = validate_partition_key(&options.partition)?;
        let encoded = values
            .iter()
            .map(pickle::serialize)
            .collect::<Result<Vec<_>>>()?;
        let ttl = options.partition_ttl.unwrap_or(DEFAULT_PARTITION_TTL);
        let partition_ttl_seconds = i32::try_from(ttl.as_secs())
            .map_err(|_| SdkError::Invalid("partition TTL is too long".to_string()))?;

        let deadline = options.timeout.map(|t| Instant::now() + t);
        let mut delay = INITIAL_PUT_BACKOFF;

        loop {
            let result = self
                .client
                .control_plane()
                .queue_put(
                    &self.ctx,
                    api::QueuePutRequest {
                        queue_id: self.queue_id.clone(),
                        values: encoded.clone(),
                        partition_key: partition_key.clone(),
                        partition_ttl_seconds,
                    },
                )
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(status) if status.code() == Code::ResourceExhausted => {}
                Err(status) => return Err(status.into()),
            }

            let mut sleep = delay;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(SdkError::QueueFull(format!("put failed on {}", self.queue_id)));
                }
                sleep = sleep.min(remaining);
            }
            debug!(delay_ms = sleep.as_millis() as u64, "queue full, backing off");
            self.ctx.sleep(sleep).await?;
            delay = (delay * 2).min(MAX_PUT_BACKOFF);
        }
    }

    /// Number of items in one partition, or in all of them.
    #[instrument(skip(self), fields(queue_id = %self.queue_id))]
    pub async fn len(&self, options: QueueLenOptions) -> Result<usize> {
        if options.total && !options.partition.is_empty() {
            return Err(SdkError::Invalid(
                "partition must be empty when requesting total length".to_string(),
            ));
        }
        let partition_key = validate_partition_key(&options.partition)?;
        let response = self
            .client
            .control_plane()
            .queue_len(
                &self.ctx,
                api::QueueLenRequest {
                    queue_id: self.queue_id.clone(),
                    partition_key,
                    total: options.total,
                },
            )
            .await?;
        Ok(usize::try_from(response.len).unwrap_or_default())
    }

    /// Stream items without removing them, ending once the queue has been
    /// idle for `item_poll_timeout`.
    pub fn iterate(&self, options: QueueIterateOptions) -> impl Stream<Item = Result<Value>> + '_ {
        let (partition_key, pending_error) = match validate_partition_key(&options.partition) {
            Ok(key) => (key, None),
            Err(err) => (Vec::new(), Some(err)),
        };
        let state = IterState {
            queue: self,
            partition_key,
            pending_error,
            item_poll_timeout: options.item_poll_timeout,
            last_entry_id: String::new(),
            buffered: VecDeque::new(),
            fetch_deadline: Instant::now() + options.item_poll_timeout,
            done: false,
        };
        stream::unfold(state, |mut state| async move {
            let item = state.next().await?;
            Some((item, state))
        })
    }
}

struct IterState<'a> {
    queue: &'a Queue,
    partition_key: Vec<u8>,
    pending_error: Option<SdkError>,
    item_poll_timeout: Duration,
    last_entry_id: String,
    buffered: VecDeque<Result<Value>>,
    fetch_deadline: Instant,
    done: bool,
}

impl IterState<'_> {
    async fn next(&mut self) -> Option<Result<Value>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }

            if let Some(err) = self.pending_error.take() {
                self.done = true;
                return Some(Err(err));
            }

            let poll = self
                .fetch_deadline
                .saturating_duration_since(Instant::now())
                .min(ITERATE_POLL_TIMEOUT);
            let response = self
                .queue
                .client
                .control_plane()
                .queue_next_items(
                    &self.queue.ctx,
                    api::QueueNextItemsRequest {
                        queue_id: self.queue.queue_id.clone(),
                        partition_key: self.partition_key.clone(),
                        last_entry_id: self.last_entry_id.clone(),
                        item_poll_timeout: poll.as_secs_f32(),
                    },
                )
                .await;

            match response {
                Err(status) => {
                    self.done = true;
                    return Some(Err(status.into()));
                }
                Ok(response) if !response.items.is_empty() => {
                    for item in response.items {
                        self.last_entry_id = item.entry_id;
                        self.buffered.push_back(pickle::deserialize(&item.value));
                    }
                    self.fetch_deadline = Instant::now() + self.item_poll_timeout;
                }
                Ok(_) if Instant::now() >= self.fetch_deadline => {
                    debug!(queue_id = %self.queue.queue_id, "queue idle, iteration finished");
                    return None;
                }
                Ok(_) => {}
            }
        }
    }
}

async fn heartbeat_loop(client: Client, ctx: Context, queue_id: String) {
    while ctx.sleep(EPHEMERAL_HEARTBEAT_INTERVAL).await.is_ok() {
        let request = api::QueueHeartbeatRequest {
            queue_id: queue_id.clone(),
        };
        match client.control_plane().queue_heartbeat(&ctx, request).await {
            Ok(_) => debug!(%queue_id, "queue heartbeat sent"),
            Err(status) if ctx.is_cancelled() => {
                debug!(%queue_id, %status, "heartbeat interrupted");
            }
            Err(status) => warn!(%queue_id, %status, "queue heartbeat failed"),
        }
    }
    debug!(%queue_id, "queue heartbeat stopped");
}
