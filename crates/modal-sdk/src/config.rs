// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client profile: credentials and server endpoint.

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};

/// Default control-plane endpoint.
pub const DEFAULT_SERVER_URL: &str = "https://api.modal.com:443";

/// Resolved credentials and endpoint for one workspace.
///
/// Profiles are immutable once a [`Client`](crate::Client) has been built
/// from them; re-initialising the SDK with a new profile rebuilds the
/// transport from scratch.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Control-plane URL (default: "https://api.modal.com:443")
    pub server_url: String,
    /// Token id (required)
    pub token_id: String,
    /// Token secret (required)
    pub token_secret: String,
    /// Default environment for lookups (None = server default)
    #[serde(default)]
    pub environment: Option<String>,
}

impl Profile {
    /// Create a profile for the default server.
    pub fn new(token_id: impl Into<String>, token_secret: impl Into<String>) -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            token_id: token_id.into(),
            token_secret: token_secret.into(),
            environment: None,
        }
    }

    /// Load the profile from environment variables.
    ///
    /// # Required Environment Variables
    /// - `MODAL_TOKEN_ID` - Token id
    /// - `MODAL_TOKEN_SECRET` - Token secret
    ///
    /// # Optional Environment Variables
    /// - `MODAL_SERVER_URL` - Server URL (default: "https://api.modal.com:443")
    /// - `MODAL_ENVIRONMENT` - Default environment name
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load the profile through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token_id = lookup("MODAL_TOKEN_ID")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SdkError::Config("MODAL_TOKEN_ID is required".to_string()))?;

        let token_secret = lookup("MODAL_TOKEN_SECRET")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SdkError::Config("MODAL_TOKEN_SECRET is required".to_string()))?;

        let server_url =
            lookup("MODAL_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        let environment = lookup("MODAL_ENVIRONMENT").filter(|v| !v.is_empty());

        Ok(Self {
            server_url,
            token_id,
            token_secret,
            environment,
        })
    }

    /// Set the control-plane URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Set the default environment.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Environment to use for a call: the explicit override if given,
    /// otherwise the profile default, otherwise empty (server default).
    pub fn environment_name(&self, explicit: Option<&str>) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| self.environment.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("server_url", &self.server_url)
            .field("token_id", &self.token_id)
            .field("token_secret", &"***")
            .field("environment", &self.environment)
            .finish()
    }
}
