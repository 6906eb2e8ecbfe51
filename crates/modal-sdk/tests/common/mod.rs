// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for modal-sdk integration tests.
//!
//! Provides an in-memory backend that answers RPCs with scripted handlers
//! and records every request it sees, plus a connector that routes endpoint
//! URLs to backends.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use modal_protocol::{RawRequest, RawResponse, RawStream, RpcInvoker};
use modal_sdk::{Client, Connector, Profile, SdkError};
use prost::Message;
use tonic::Status;
use tonic::metadata::MetadataMap;

pub const CONTROL_PLANE_URL: &str = "http://control-plane.test:443";
pub const INPUT_PLANE_URL: &str = "http://input-plane.test:443";

type UnaryHandler =
    Box<dyn FnMut(&RawRequest) -> Result<(RawResponse, Duration), Status> + Send>;
type StreamHandler =
    Box<dyn FnMut(&RawRequest) -> Result<Vec<Result<Bytes, Status>>, Status> + Send>;

/// Scripted in-memory backend.
#[derive(Default)]
pub struct FakeBackend {
    unary: Mutex<HashMap<&'static str, UnaryHandler>>,
    streams: Mutex<HashMap<&'static str, StreamHandler>>,
    calls: Mutex<Vec<RawRequest>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `method` with a handler that sees raw requests and builds raw
    /// responses (to script metadata).
    pub fn on_raw<F>(&self, method: &'static str, mut handler: F)
    where
        F: FnMut(&RawRequest) -> Result<RawResponse, Status> + Send + 'static,
    {
        let handler: UnaryHandler =
            Box::new(move |request: &RawRequest| Ok((handler(request)?, Duration::ZERO)));
        self.unary.lock().unwrap().insert(method, handler);
    }

    /// Answer `method` with a typed handler.
    pub fn on<Req, Resp, F>(&self, method: &'static str, mut handler: F)
    where
        Req: Message + Default,
        Resp: Message,
        F: FnMut(Req) -> Result<Resp, Status> + Send + 'static,
    {
        self.on_delayed(method, move |request: Req| Ok((handler(request)?, Duration::ZERO)));
    }

    /// Answer `method` with a typed handler whose reply is held back for the
    /// returned duration, the way long-poll RPCs block server-side.
    pub fn on_delayed<Req, Resp, F>(&self, method: &'static str, mut handler: F)
    where
        Req: Message + Default,
        Resp: Message,
        F: FnMut(Req) -> Result<(Resp, Duration), Status> + Send + 'static,
    {
        let handler: UnaryHandler = Box::new(move |request: &RawRequest| {
            let decoded = Req::decode(request.body.clone())
                .map_err(|e| Status::internal(format!("fake backend decode: {e}")))?;
            let (response, delay) = handler(decoded)?;
            Ok((RawResponse::new(response.encode_to_vec()), delay))
        });
        self.unary.lock().unwrap().insert(method, handler);
    }

    /// Answer the server-streaming `method`; each call yields the returned
    /// messages and then ends.
    pub fn on_stream<Req, Resp, F>(&self, method: &'static str, mut handler: F)
    where
        Req: Message + Default,
        Resp: Message,
        F: FnMut(Req) -> Result<Vec<Result<Resp, Status>>, Status> + Send + 'static,
    {
        let handler: StreamHandler = Box::new(move |request: &RawRequest| {
            let decoded = Req::decode(request.body.clone())
                .map_err(|e| Status::internal(format!("fake backend decode: {e}")))?;
            Ok(handler(decoded)?
                .into_iter()
                .map(|item| item.map(|message| Bytes::from(message.encode_to_vec())))
                .collect())
        });
        self.streams.lock().unwrap().insert(method, handler);
    }

    /// Every raw request sent to `method`, in order.
    pub fn calls(&self, method: &str) -> Vec<RawRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    /// Every request sent to `method`, decoded.
    pub fn requests<Req: Message + Default>(&self, method: &str) -> Vec<Req> {
        self.calls(method)
            .into_iter()
            .map(|r| Req::decode(r.body).unwrap())
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls(method).len()
    }

    fn record(&self, request: &RawRequest) {
        self.calls.lock().unwrap().push(request.clone());
    }
}

#[async_trait]
impl RpcInvoker for FakeBackend {
    async fn unary(&self, request: RawRequest) -> Result<RawResponse, Status> {
        self.record(&request);
        let (response, delay) = {
            let mut handlers = self.unary.lock().unwrap();
            match handlers.get_mut(request.method) {
                Some(handler) => handler(&request)?,
                None => {
                    return Err(Status::unimplemented(format!(
                        "no handler for {}",
                        request.method
                    )));
                }
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(response)
    }

    async fn server_streaming(&self, request: RawRequest) -> Result<RawStream, Status> {
        self.record(&request);
        let messages = {
            let mut handlers = self.streams.lock().unwrap();
            match handlers.get_mut(request.method) {
                Some(handler) => handler(&request)?,
                None => {
                    return Err(Status::unimplemented(format!(
                        "no handler for {}",
                        request.method
                    )));
                }
            }
        };
        Ok(RawStream {
            headers: MetadataMap::new(),
            messages: futures::stream::iter(messages).boxed(),
        })
    }
}

/// Routes endpoint URLs to fake backends.
#[derive(Default)]
pub struct FakeConnector {
    backends: HashMap<String, Arc<FakeBackend>>,
    connects: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(routes: &[(&str, Arc<FakeBackend>)]) -> Arc<Self> {
        Arc::new(Self {
            backends: routes
                .iter()
                .map(|(url, backend)| (url.to_string(), backend.clone()))
                .collect(),
            connects: Mutex::new(Vec::new()),
        })
    }

    /// URLs a connection was opened to, in order.
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, url: &str) -> modal_sdk::Result<Arc<dyn RpcInvoker>> {
        self.connects.lock().unwrap().push(url.to_string());
        match self.backends.get(url) {
            Some(backend) => Ok(backend.clone()),
            None => Err(SdkError::Invalid(format!("no fake backend for {url}"))),
        }
    }
}

pub fn test_profile() -> Profile {
    Profile::new("ak-test", "as-test").with_server_url(CONTROL_PLANE_URL)
}

/// Client whose control plane is `backend`.
pub fn client_for(backend: &Arc<FakeBackend>) -> Client {
    Client::with_connector(
        test_profile(),
        FakeConnector::new(&[(CONTROL_PLANE_URL, backend.clone())]),
    )
    .unwrap()
}

/// Client with a control plane and an input plane.
pub fn client_with_input_plane(control: &Arc<FakeBackend>, input: &Arc<FakeBackend>) -> Client {
    Client::with_connector(
        test_profile(),
        FakeConnector::new(&[
            (CONTROL_PLANE_URL, control.clone()),
            (INPUT_PLANE_URL, input.clone()),
        ]),
    )
    .unwrap()
}

pub fn header(request: &RawRequest, key: &str) -> Option<String> {
    request
        .metadata
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
