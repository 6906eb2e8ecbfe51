// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.

use std::time::Duration;

use modal_protocol::ClientError;
use thiserror::Error;
use tonic::{Code, Status};

/// Errors that can occur in the SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// Building a channel to an endpoint failed
    #[error("connection error: {0}")]
    Connection(#[from] ClientError),

    /// RPC failed with a status the client does not interpret
    #[error("rpc error: {:?}: {}", .0.code(), .0.message())]
    Rpc(#[from] Status),

    /// Referenced object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid argument supplied by the caller
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The remote function exceeded its own timeout
    #[error("function timed out: {0}")]
    FunctionTimeout(String),

    /// No output arrived before the caller's deadline
    #[error("timed out waiting for output after {:.1}s", .0.as_secs_f64())]
    OutputTimeout(Duration),

    /// The backend failed to run the input; the invocation may be retried
    #[error("internal failure: {0}")]
    InternalFailure(String),

    /// User code raised an exception on the remote side
    #[error("remote error: {exception}")]
    Remote {
        /// Remote exception description
        exception: String,
        /// Remote traceback, if provided
        traceback: String,
    },

    /// A backend operation did not complete as expected
    #[error("execution error: {0}")]
    Execution(String),

    /// Queue had no items within the timeout
    #[error("queue empty: {0}")]
    QueueEmpty(String),

    /// Queue stayed full until the timeout
    #[error("queue full: {0}")]
    QueueFull(String),

    /// A sandbox operation timed out
    #[error("sandbox timed out: {0}")]
    SandboxTimeout(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Out-of-band blob transfer failed
    #[error("blob error: {0}")]
    Blob(String),
}

impl SdkError {
    /// gRPC status code, if this error came from an RPC.
    pub fn code(&self) -> Option<Code> {
        match self {
            SdkError::Rpc(status) => Some(status.code()),
            _ => None,
        }
    }

    /// Whether the error was caused by context cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.code() == Some(Code::Cancelled)
    }

    /// Whether the error is any flavour of timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SdkError::FunctionTimeout(_) | SdkError::OutputTimeout(_) | SdkError::SandboxTimeout(_)
        ) || self.code() == Some(Code::DeadlineExceeded)
    }

    /// Map a NOT_FOUND status to [`SdkError::NotFound`], leaving others untouched.
    pub(crate) fn not_found_or(status: Status, message: impl FnOnce() -> String) -> Self {
        if status.code() == Code::NotFound {
            SdkError::NotFound(message())
        } else {
            SdkError::Rpc(status)
        }
    }
}

impl From<prost::DecodeError> for SdkError {
    fn from(err: prost::DecodeError) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

impl From<serde_pickle::Error> for SdkError {
    fn from(err: serde_pickle::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_timeout_message() {
        let err = SdkError::OutputTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timed out waiting for output after 1.5s");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_cancelled_status() {
        let err = SdkError::from(Status::cancelled("context cancelled"));
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_not_found_mapping() {
        let err = SdkError::not_found_or(Status::not_found("nope"), || "function 'a/b'".into());
        assert!(matches!(err, SdkError::NotFound(ref m) if m == "function 'a/b'"));

        let err = SdkError::not_found_or(Status::unavailable("down"), || unreachable!());
        assert_eq!(err.code(), Some(Code::Unavailable));
    }
}
