// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Out-of-band transfer of large payloads through pre-signed URLs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use md5::Md5;
use modal_protocol::api::{self, blob_create_response::UploadTypeOneof};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, SdkError};

/// Payloads of this size or larger are uploaded instead of sent inline.
pub const MAX_OBJECT_SIZE_BYTES: usize = 2 * 1024 * 1024;

/// Whether a payload of `len` bytes must go through blob storage.
pub fn needs_upload(len: usize) -> bool {
    len >= MAX_OBJECT_SIZE_BYTES
}

/// Base64 MD5 and SHA-256 digests of `data`.
pub fn digests(data: &[u8]) -> (String, String) {
    let md5 = STANDARD.encode(Md5::digest(data));
    let sha256 = STANDARD.encode(Sha256::digest(data));
    (md5, sha256)
}

/// Upload `data` and return the blob id.
#[instrument(skip(client, ctx, data), fields(len = data.len()))]
pub(crate) async fn upload(client: &Client, ctx: &Context, data: Bytes) -> Result<String> {
    let (content_md5, content_sha256_base64) = digests(&data);
    let content_length =
        i64::try_from(data.len()).map_err(|_| SdkError::Blob("payload too large".to_string()))?;

    let response = client
        .control_plane()
        .blob_create(
            ctx,
            api::BlobCreateRequest {
                content_md5: content_md5.clone(),
                content_sha256_base64,
                content_length,
            },
        )
        .await?;

    let upload_url = match response.upload_type_oneof {
        Some(UploadTypeOneof::UploadUrl(url)) => url,
        Some(UploadTypeOneof::Multipart(_)) => {
            return Err(SdkError::Blob(
                "payload exceeds the multipart upload threshold, unsupported by this client"
                    .to_string(),
            ));
        }
        None => {
            return Err(SdkError::Blob(
                "missing upload URL in BlobCreate response".to_string(),
            ));
        }
    };

    let request = client
        .http()
        .put(upload_url)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .header("Content-MD5", content_md5)
        .body(data);
    transfer(ctx, request, "upload").await?;

    debug!(blob_id = %response.blob_id, "uploaded blob");
    Ok(response.blob_id)
}

/// Download the blob `blob_id` in full.
#[instrument(skip(client, ctx))]
pub(crate) async fn download(client: &Client, ctx: &Context, blob_id: &str) -> Result<Bytes> {
    let response = client
        .control_plane()
        .blob_get(
            ctx,
            api::BlobGetRequest {
                blob_id: blob_id.to_string(),
            },
        )
        .await?;

    let data = transfer(ctx, client.http().get(response.download_url), "download").await?;
    debug!(len = data.len(), "downloaded blob");
    Ok(data)
}

/// Send `request` and read the whole body, aborting if `ctx` finishes.
async fn transfer(ctx: &Context, request: reqwest::RequestBuilder, what: &str) -> Result<Bytes> {
    let exchange = async {
        let response = request
            .send()
            .await
            .map_err(|e| SdkError::Blob(format!("{what} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SdkError::Blob(format!("{what} failed with status {status}")));
        }
        response
            .bytes()
            .await
            .map_err(|e| SdkError::Blob(format!("failed to read {what} response: {e}")))
    };

    tokio::select! {
        status = ctx.done() => Err(status.into()),
        result = exchange => result,
    }
}
