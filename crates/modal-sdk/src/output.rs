// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interpretation of function results.

use bytes::Bytes;
use modal_protocol::api::{self, DataFormat, GenericStatus, generic_result::DataOneof};
use prost::Message;

use crate::blob;
use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, SdkError};
use crate::pickle::{self, Value};

/// Successful result of a function call.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Unpickled return value.
    Value(Value),
    /// Completion marker emitted by generator functions.
    GeneratorDone(api::GeneratorDone),
}

impl Output {
    /// The returned value, or `None` for a generator completion marker.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Output::Value(value) => Some(value),
            Output::GeneratorDone(_) => None,
        }
    }
}

/// Turn one output item into the call's outcome.
pub(crate) async fn process_item(
    client: &Client,
    ctx: &Context,
    item: api::FunctionGetOutputsItem,
) -> Result<Output> {
    let format = item.data_format();
    let Some(result) = item.result else {
        return Err(SdkError::Remote {
            exception: "received null result from invocation".to_string(),
            traceback: String::new(),
        });
    };

    check_status(&result)?;

    let data = match result.data_oneof {
        Some(DataOneof::Data(data)) => Bytes::from(data),
        Some(DataOneof::DataBlobId(blob_id)) => blob::download(client, ctx, &blob_id).await?,
        None => Bytes::new(),
    };
    decode(&data, format)
}

/// Map a non-success status to its error.
pub(crate) fn check_status(result: &api::GenericResult) -> Result<()> {
    match result.status() {
        GenericStatus::Success => Ok(()),
        GenericStatus::Timeout => Err(SdkError::FunctionTimeout(result.exception.clone())),
        GenericStatus::InternalFailure => Err(SdkError::InternalFailure(result.exception.clone())),
        _ => Err(SdkError::Remote {
            exception: result.exception.clone(),
            traceback: result.traceback.clone(),
        }),
    }
}

fn decode(data: &[u8], format: DataFormat) -> Result<Output> {
    match format {
        DataFormat::Pickle => Ok(Output::Value(pickle::deserialize(data)?)),
        DataFormat::GeneratorDone => Ok(Output::GeneratorDone(api::GeneratorDone::decode(data)?)),
        other => Err(SdkError::Serialization(format!(
            "unsupported data format: {other:?}"
        ))),
    }
}
