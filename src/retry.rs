// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Coordination
//!
//! Decides what happens to a message whose handler failed. The retry count travels
//! in the `x-retry-count` header; each retry picks its delay from an ordered schedule
//! and the message is republished through the queue's retry exchange, where it waits
//! out the delay before being dead-lettered back to the main queue.

use crate::message::{
    HeaderValue, Headers, IncomingMessage, HEADER_ORIGINAL_EXCHANGE,
    HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
};
use std::time::Duration;

/// Consumer-side retry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    /// Delay before each retry; the last entry is reused once the schedule runs out.
    pub delays: Vec<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            enabled: false,
            max_retries: 3,
            delays: vec![
                Duration::from_millis(1_000),
                Duration::from_millis(5_000),
                Duration::from_millis(10_000),
            ],
        }
    }
}

impl RetryConfig {
    /// Enabled retry configuration.
    pub fn new(max_retries: u32, delays: Vec<Duration>) -> Self {
        RetryConfig {
            enabled: true,
            max_retries,
            delays,
        }
    }

    /// No retries; failures are requeued or discarded.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Delay before the `attempt`-th retry (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) - 1) as usize;
        self.delays
            .get(idx)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }
}

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Republish through the retry exchange; `attempt` becomes the new retry count.
    Retry { attempt: u32, delay: Duration },
    /// Reject with requeue; the broker redelivers immediately.
    Requeue,
    /// Remove the message from the queue.
    Discard { reason: DiscardReason },
}

/// Why a message left the retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    RetriesExhausted,
    RequeueDisabled,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::RetriesExhausted => "max retries exceeded",
            DiscardReason::RequeueDisabled => "requeue disabled",
        }
    }
}

/// Three-way failure policy of a consumer subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    pub retry: RetryConfig,
    /// Whether the retry topology is available to route through.
    pub retry_available: bool,
    pub requeue: bool,
}

impl FailurePolicy {
    /// Picks the outcome for a message that has already been retried `retry_count`
    /// times.
    ///
    /// # Parameters
    /// * `retry_count` - Value of `x-retry-count` on the failed delivery
    ///
    /// # Returns
    /// Retry with the next attempt and its delay, requeue, or discard with a reason
    pub fn decide(&self, retry_count: u32) -> FailureAction {
        if self.retry.enabled && self.retry_available {
            let attempt = retry_count.saturating_add(1);
            if attempt <= self.retry.max_retries {
                return FailureAction::Retry {
                    attempt,
                    delay: self.retry.delay_for(attempt),
                };
            }

            return FailureAction::Discard {
                reason: DiscardReason::RetriesExhausted,
            };
        }

        if self.requeue {
            return FailureAction::Requeue;
        }

        FailureAction::Discard {
            reason: DiscardReason::RequeueDisabled,
        }
    }
}

/// Reads `x-retry-count`; absent, negative or malformed values count as 0.
pub fn retry_count(headers: &Headers) -> u32 {
    headers
        .get(HEADER_RETRY_COUNT)
        .and_then(HeaderValue::as_i64)
        .map(|v| v.clamp(0, u32::MAX as i64) as u32)
        .unwrap_or(0)
}

/// Headers for republishing `message` as retry number `attempt`. Caller headers are
/// kept and the original exchange and routing key are recorded on the first retry.
pub fn retry_headers(message: &IncomingMessage, attempt: u32) -> Headers {
    let mut headers = message.headers.clone();

    headers.insert(HEADER_RETRY_COUNT.to_owned(), HeaderValue::from(attempt));
    headers
        .entry(HEADER_ORIGINAL_EXCHANGE.to_owned())
        .or_insert_with(|| HeaderValue::from(message.exchange.as_str()));
    headers
        .entry(HEADER_ORIGINAL_ROUTING_KEY.to_owned())
        .or_insert_with(|| HeaderValue::from(message.routing_key.as_str()));

    headers
}
