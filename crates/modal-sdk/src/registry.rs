// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide default client.
//!
//! Code that does not thread a [`Client`] through can fetch the one
//! registered here. The first call to [`global`] builds one from environment
//! variables. [`init`] replaces it atomically: callers
//! observe either the old client or the new one, never a mix of profile and
//! transport.

use std::sync::RwLock;

use once_cell::sync::Lazy;
use tracing::info;

use crate::client::Client;
use crate::config::Profile;
use crate::error::{Result, SdkError};

static DEFAULT_CLIENT: Lazy<RwLock<Option<Client>>> = Lazy::new(|| RwLock::new(None));

fn poisoned() -> SdkError {
    SdkError::Config("default client registry poisoned".to_string())
}

/// Build a client for `profile` and make it the process default.
pub fn init(profile: Profile) -> Result<Client> {
    let client = Client::new(profile)?;
    init_with(client.clone())?;
    Ok(client)
}

/// Register an already-built client as the process default.
///
/// The previous default is only unregistered, not closed: handles created
/// from it keep working until it is dropped or closed by its owner.
pub fn init_with(client: Client) -> Result<()> {
    let previous = {
        let mut slot = DEFAULT_CLIENT.write().map_err(|_| poisoned())?;
        slot.replace(client)
    };
    if previous.is_some() {
        info!("replacing default client");
    }
    Ok(())
}

/// The process default client, built from the environment on first use.
pub fn global() -> Result<Client> {
    if let Some(client) = DEFAULT_CLIENT.read().map_err(|_| poisoned())?.as_ref() {
        return Ok(client.clone());
    }

    let mut slot = DEFAULT_CLIENT.write().map_err(|_| poisoned())?;
    if let Some(client) = slot.as_ref() {
        return Ok(client.clone());
    }
    let client = Client::from_env()?;
    *slot = Some(client.clone());
    Ok(client)
}
