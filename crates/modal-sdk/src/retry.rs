// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-call options and the transient-error retry policy.

use std::time::Duration;

use tonic::Code;

/// Status codes retried by default.
pub const DEFAULT_RETRYABLE_CODES: [Code; 5] = [
    Code::DeadlineExceeded,
    Code::Unavailable,
    Code::Cancelled,
    Code::Internal,
    Code::Unknown,
];

/// Whether `code` is one of the default transient codes.
pub fn is_retryable_code(code: Code) -> bool {
    DEFAULT_RETRYABLE_CODES.contains(&code)
}

/// Exponential backoff policy for one logical RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = a single attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after every retry.
    pub delay_factor: f64,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Codes retried in addition to [`DEFAULT_RETRYABLE_CODES`].
    pub additional_codes: Vec<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            delay_factor: 2.0,
            max_delay: Duration::from_secs(1),
            additional_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Default policy with any overrides from `options` applied.
    pub fn from_options(options: &CallOptions) -> Self {
        let default = Self::default();
        Self {
            max_retries: options.retries.unwrap_or(default.max_retries),
            base_delay: options.base_delay.unwrap_or(default.base_delay),
            delay_factor: options.delay_factor.unwrap_or(default.delay_factor),
            max_delay: options.max_delay.unwrap_or(default.max_delay),
            additional_codes: options.additional_status_codes.clone(),
        }
    }

    pub fn should_retry(&self, code: Code) -> bool {
        is_retryable_code(code) || self.additional_codes.contains(&code)
    }

    /// Delay before the given retry (1-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.base_delay.as_secs_f64() * self.delay_factor.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay.max(0.0))
        }
    }
}

/// Options for a single RPC.
///
/// Unset fields fall back to [`RetryPolicy::default`] and to no per-call
/// timeout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    /// Per-attempt timeout; never lengthens a deadline already on the context.
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub base_delay: Option<Duration>,
    pub delay_factor: Option<f64>,
    pub max_delay: Option<Duration>,
    pub additional_status_codes: Vec<Code>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    pub fn with_delay_factor(mut self, factor: f64) -> Self {
        self.delay_factor = Some(factor);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn with_additional_status_code(mut self, code: Code) -> Self {
        self.additional_status_codes.push(code);
        self
    }
}
