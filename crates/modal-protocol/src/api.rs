// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages for the `modal.client.ModalClient` service.
//!
//! Generated from `proto/api.proto` at build time. Only the subset of the
//! backend schema used by the client core is declared; unknown fields sent by
//! a newer backend are skipped by prost on decode.

#![allow(clippy::derive_partial_eq_without_eq)]

include!(concat!(env!("OUT_DIR"), "/modal.client.rs"));

/// Fully-qualified gRPC method paths.
pub mod methods {
    macro_rules! method_paths {
        ($($name:ident => $rpc:literal),* $(,)?) => {
            $(pub const $name: &str = concat!("/modal.client.ModalClient/", $rpc);)*
        };
    }

    method_paths! {
        FUNCTION_GET => "FunctionGet",
        FUNCTION_BIND_PARAMS => "FunctionBindParams",
        FUNCTION_MAP => "FunctionMap",
        FUNCTION_RETRY_INPUTS => "FunctionRetryInputs",
        FUNCTION_GET_OUTPUTS => "FunctionGetOutputs",
        FUNCTION_CALL_CANCEL => "FunctionCallCancel",
        ATTEMPT_START => "AttemptStart",
        ATTEMPT_AWAIT => "AttemptAwait",
        ATTEMPT_RETRY => "AttemptRetry",
        BLOB_CREATE => "BlobCreate",
        BLOB_GET => "BlobGet",
        QUEUE_GET_OR_CREATE => "QueueGetOrCreate",
        QUEUE_DELETE => "QueueDelete",
        QUEUE_HEARTBEAT => "QueueHeartbeat",
        QUEUE_CLEAR => "QueueClear",
        QUEUE_GET => "QueueGet",
        QUEUE_PUT => "QueuePut",
        QUEUE_LEN => "QueueLen",
        QUEUE_NEXT_ITEMS => "QueueNextItems",
        SANDBOX_CREATE => "SandboxCreate",
        SANDBOX_WAIT => "SandboxWait",
        SANDBOX_TERMINATE => "SandboxTerminate",
        SANDBOX_GET_TASK_ID => "SandboxGetTaskId",
        SANDBOX_GET_TUNNELS => "SandboxGetTunnels",
        SANDBOX_SNAPSHOT_FS => "SandboxSnapshotFs",
        SANDBOX_STDIN_WRITE => "SandboxStdinWrite",
        SANDBOX_GET_LOGS => "SandboxGetLogs",
        CONTAINER_EXEC => "ContainerExec",
        CONTAINER_EXEC_PUT_INPUT => "ContainerExecPutInput",
        CONTAINER_EXEC_WAIT => "ContainerExecWait",
        CONTAINER_EXEC_GET_OUTPUT => "ContainerExecGetOutput",
    }
}
