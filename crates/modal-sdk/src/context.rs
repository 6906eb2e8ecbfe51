// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cancellation and deadline propagation.
//!
//! A [`Context`] travels from a public operation down through retry loops,
//! poll loops and stream tasks into each in-flight RPC. Cancelling it, or
//! letting its deadline pass, makes every suspended operation return
//! promptly.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Cancellation signal plus optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Child context: cancelled with its parent, cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child context with a deadline `timeout` from now.
    ///
    /// An earlier deadline inherited from the parent is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline (zero once passed).
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Error describing why the context is done, if it is.
    pub fn err(&self) -> Option<Status> {
        if self.token.is_cancelled() {
            Some(cancelled_status())
        } else if self.remaining() == Some(Duration::ZERO) {
            Some(deadline_status())
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Status {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => cancelled_status(),
                    _ = tokio::time::sleep_until(deadline) => deadline_status(),
                }
            }
            None => {
                self.token.cancelled().await;
                cancelled_status()
            }
        }
    }

    /// Run `fut` unless the context finishes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        if let Some(status) = self.err() {
            return Err(status);
        }
        tokio::select! {
            biased;
            status = self.done() => Err(status),
            result = fut => result,
        }
    }

    /// Sleep for `duration`, returning early with an error if the context finishes.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Status> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}

fn cancelled_status() -> Status {
    Status::cancelled("context cancelled")
}

fn deadline_status() -> Status {
    Status::deadline_exceeded("context deadline exceeded")
}
