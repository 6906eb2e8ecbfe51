// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client state shared by every handle: profile, auth token, connections.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use modal_protocol::{ChannelConfig, ClientError, GrpcInvoker, RpcInvoker};
use tracing::{debug, info};

use crate::config::Profile;
use crate::context::Context;
use crate::error::{Result, SdkError};
use crate::middleware::{AuthMiddleware, AuthTokenStore};
use crate::transport::ApiClient;

/// Creates invokers for backend endpoints.
///
/// The default [`GrpcConnector`] opens lazy gRPC channels; tests plug in
/// in-memory backends.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Arc<dyn RpcInvoker>>;
}

/// [`Connector`] that opens `tonic` channels.
#[derive(Debug, Clone, Default)]
pub struct GrpcConnector {
    config: ChannelConfig,
}

impl GrpcConnector {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config }
    }
}

impl Connector for GrpcConnector {
    fn connect(&self, url: &str) -> Result<Arc<dyn RpcInvoker>> {
        match GrpcInvoker::connect(url, &self.config) {
            Ok(invoker) => Ok(Arc::new(invoker)),
            Err(ClientError::InvalidEndpoint { url, reason }) => {
                Err(SdkError::Invalid(format!("invalid endpoint '{url}': {reason}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Handle to the SDK state. Cheap to clone.
///
/// Holds the resolved [`Profile`], the auth token shared by all of its
/// connections, one connection per endpoint URL (control plane plus any
/// input planes), the HTTP client used for blob transfers, and a root
/// [`Context`] that every handle created from this client inherits.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    profile: Profile,
    auth: Arc<AuthMiddleware>,
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<String, ApiClient>>,
    control_plane: ApiClient,
    http: reqwest::Client,
    ctx: Context,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("profile", &self.inner.profile)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client that talks gRPC to the profile's server.
    ///
    /// Must be called within a Tokio runtime: channels are created lazily
    /// but spawn their background workers immediately.
    pub fn new(profile: Profile) -> Result<Self> {
        Self::with_connector(profile, Arc::new(GrpcConnector::default()))
    }

    /// Build a client from `MODAL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(Profile::from_env()?)
    }

    /// Build a client with a custom [`Connector`].
    pub fn with_connector(profile: Profile, connector: Arc<dyn Connector>) -> Result<Self> {
        let tokens = Arc::new(AuthTokenStore::new());
        let auth = AuthMiddleware::new(&profile, tokens)
            .map_err(|status| SdkError::Config(status.message().to_string()))?;
        let auth = Arc::new(auth);

        let invoker = connector.connect(&profile.server_url)?;
        let control_plane = ApiClient::new(&profile.server_url, invoker, auth.clone());

        let mut connections = HashMap::new();
        connections.insert(profile.server_url.clone(), control_plane.clone());

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SdkError::Config(format!("failed to build HTTP client: {e}")))?;

        info!(server_url = %profile.server_url, "client initialised");

        Ok(Self {
            inner: Arc::new(ClientInner {
                profile,
                auth,
                connector,
                connections: RwLock::new(connections),
                control_plane,
                http,
                ctx: Context::new(),
            }),
        })
    }

    pub fn profile(&self) -> &Profile {
        &self.inner.profile
    }

    /// Root context; cancelled by [`close`](Self::close).
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Cancel every operation and background task started from this client.
    pub fn close(&self) {
        self.inner.ctx.cancel();
    }

    pub(crate) fn environment_name(&self, explicit: Option<&str>) -> String {
        self.inner.profile.environment_name(explicit)
    }

    pub(crate) fn control_plane(&self) -> &ApiClient {
        &self.inner.control_plane
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Connection to `url`, created on first use and cached for the
    /// lifetime of the client.
    pub(crate) fn connection(&self, url: &str) -> Result<ApiClient> {
        if let Some(existing) = self
            .inner
            .connections
            .read()
            .map_err(|_| SdkError::Config("connection registry poisoned".to_string()))?
            .get(url)
        {
            return Ok(existing.clone());
        }

        let mut connections = self
            .inner
            .connections
            .write()
            .map_err(|_| SdkError::Config("connection registry poisoned".to_string()))?;
        if let Some(existing) = connections.get(url) {
            return Ok(existing.clone());
        }

        debug!(url, "opening connection");
        let invoker = self.inner.connector.connect(url)?;
        let client = ApiClient::new(url, invoker, self.inner.auth.clone());
        connections.insert(url.to_string(), client.clone());
        Ok(client)
    }
}
