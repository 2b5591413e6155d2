// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! Publishes JSON messages to one exchange. Besides plain publishing the producer
//! offers a retrying publish for transient broker unavailability and scheduled
//! delivery through a TTL holding queue (see [`DelayTopology`]).
//!
//! Trace context of the current OpenTelemetry context is injected into the headers
//! of every message.

use crate::{
    channel::{AmqpChannel, ChannelProvider},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{HeaderValue, Headers, MessageProperties, OutgoingMessage, JSON_CONTENT_TYPE},
    otel,
    topology::DelayTopology,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Per-message publishing options.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    /// Persistent messages survive broker restarts when routed to durable queues.
    pub persistent: bool,
    pub priority: Option<u8>,
    pub headers: Headers,
    pub expiration: Option<Duration>,
    /// Defaults to a random UUID.
    pub message_id: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            persistent: true,
            priority: None,
            headers: Headers::new(),
            expiration: None,
            message_id: None,
        }
    }
}

impl PublishOptions {
    /// Persistent JSON message with no priority or expiration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivery mode of the message.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Higher values are delivered first by queues declared with a max priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Adds one application header.
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Replaces all application headers.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Per-message TTL.
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Overrides the generated message id.
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }
}

/// Backoff applied by [`Producer::publish_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for PublishRetryPolicy {
    fn default() -> Self {
        PublishRetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            backoff_factor: 2.0,
        }
    }
}

impl PublishRetryPolicy {
    /// # Parameters
    /// * `max_retries` - Retries after the first attempt
    /// * `initial_delay` - Wait before the first retry
    /// * `backoff_factor` - Multiplier applied to the wait after each retry
    pub fn new(max_retries: u32, initial_delay: Duration, backoff_factor: f64) -> Self {
        PublishRetryPolicy {
            max_retries,
            initial_delay,
            backoff_factor,
        }
    }

    /// Wait before retry `attempt` (0-based): `initial_delay * backoff_factor^attempt`.
    ///
    /// # Returns
    /// The computed delay, saturating at `Duration::MAX` when it overflows.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.backoff_factor.max(0.0).powi(exponent);
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Default)]
struct ProducerState {
    channel: Option<Arc<dyn AmqpChannel>>,
    delay_installed: bool,
    closed: bool,
}

/// Publishes messages to one exchange over a dedicated channel.
pub struct Producer {
    provider: Arc<dyn ChannelProvider>,
    exchange: ExchangeDefinition,
    delay: DelayTopology,
    state: Mutex<ProducerState>,
}

/// Creates a producer and declares its exchange.
///
/// # Parameters
/// * `provider` - Source of channels
/// * `exchange` - Exchange name
/// * `kind` - Exchange type
/// * `durable` - Whether the exchange survives broker restarts
///
/// # Returns
/// A Producer whose exchange is declared
pub async fn create_producer(
    provider: Arc<dyn ChannelProvider>,
    exchange: &str,
    kind: ExchangeKind,
    durable: bool,
) -> Result<Arc<Producer>, AmqpError> {
    let producer = Producer::new(
        provider,
        ExchangeDefinition::new(exchange).kind(kind).durable(durable),
    );
    producer.declare_exchange().await?;
    Ok(Arc::new(producer))
}

impl Producer {
    /// Creates a producer without touching the broker; the channel is opened on
    /// first use.
    pub fn new(provider: Arc<dyn ChannelProvider>, exchange: ExchangeDefinition) -> Producer {
        Producer {
            provider,
            delay: DelayTopology::for_exchange(&exchange.name),
            exchange,
            state: Mutex::new(ProducerState::default()),
        }
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    /// Declares the exchange. Redeclaring identically is a no-op; a type conflict
    /// with an existing exchange fails.
    pub async fn declare_exchange(&self) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        channel.exchange_declare(&self.exchange).await?;
        debug!(
            exchange = self.exchange.name,
            kind = self.exchange.kind.as_str(),
            "exchange declared"
        );
        Ok(())
    }

    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Err(AmqpError::ChannelClosed);
        }

        if let Some(channel) = state.channel.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            warn!(exchange = self.exchange.name, "producer channel closed, reopening");
            state.delay_installed = false;
        }

        let channel = self.provider.open_channel().await?;
        state.channel = Some(channel.clone());
        Ok(channel)
    }

    async fn forget_channel(&self, channel: &Arc<dyn AmqpChannel>) {
        let mut state = self.state.lock().await;
        if let Some(current) = state.channel.as_ref() {
            if Arc::ptr_eq(current, channel) {
                state.channel = None;
                state.delay_installed = false;
            }
        }
    }

    async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Serializes `payload` as JSON and publishes it with `routing_key`.
    ///
    /// The broker acknowledgement is not awaited. Errors surface when the channel
    /// or connection is unusable.
    ///
    /// # Parameters
    /// * `payload` - Value serialized as JSON
    /// * `routing_key` - Routing key used by the exchange
    /// * `options` - Delivery mode, priority, headers and expiration
    ///
    /// # Returns
    /// `Ok` once the broker accepted the publish
    pub async fn publish<T>(
        &self,
        payload: &T,
        routing_key: &str,
        options: &PublishOptions,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = serialize(payload)?;
        self.send(&self.exchange.name, routing_key, body, options).await
    }

    /// Publishes, retrying publish-time failures with exponential backoff. After
    /// `max_retries` retries the last error is returned.
    ///
    /// # Parameters
    /// * `payload` - Value serialized as JSON
    /// * `routing_key` - Routing key used by the exchange
    /// * `options` - Delivery mode, priority, headers and expiration
    /// * `policy` - Retry count and backoff
    ///
    /// # Returns
    /// The last publish error once retries run out
    pub async fn publish_with_retry<T>(
        &self,
        payload: &T,
        routing_key: &str,
        options: &PublishOptions,
        policy: &PublishRetryPolicy,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = serialize(payload)?;
        let mut attempt = 0;

        loop {
            let err = match self
                .send(&self.exchange.name, routing_key, body.clone(), options)
                .await
            {
                Ok(()) => {
                    if attempt > 0 {
                        debug!(attempt, "message published after retries");
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            if attempt >= policy.max_retries || self.is_closed().await {
                error!(
                    error = err.to_string(),
                    exchange = self.exchange.name,
                    routing_key,
                    attempts = attempt + 1,
                    "giving up publishing message"
                );
                return Err(err);
            }

            let delay = policy.delay_for(attempt);
            attempt += 1;
            warn!(
                error = err.to_string(),
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "publish failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Publishes a message that becomes visible to consumers after `delay`.
    ///
    /// The message waits in the producer's delay queue with a TTL of `delay`, then is
    /// dead-lettered into the exchange with its routing key. Any expiration in
    /// `options` is replaced by `delay`.
    ///
    /// # Parameters
    /// * `payload` - Value serialized as JSON
    /// * `routing_key` - Routing key applied when the message is released
    /// * `delay` - Time before consumers can see the message
    /// * `options` - Publish options; the expiration is replaced by `delay`
    pub async fn schedule_message<T>(
        &self,
        payload: &T,
        routing_key: &str,
        delay: Duration,
        options: &PublishOptions,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = serialize(payload)?;

        if delay.is_zero() {
            return self.send(&self.exchange.name, routing_key, body, options).await;
        }

        self.install_delay_topology().await?;

        let options = options.clone().expiration(delay);
        debug!(
            routing_key,
            delay_ms = delay.as_millis() as u64,
            "scheduling message"
        );
        self.send(&self.delay.delay_exchange, routing_key, body, &options)
            .await
    }

    async fn install_delay_topology(&self) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        let mut state = self.state.lock().await;
        if state.delay_installed {
            return Ok(());
        }

        self.delay
            .definition(self.exchange.durable)
            .install(channel.as_ref())
            .await?;
        state.delay_installed = true;

        Ok(())
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let mut headers = options.headers.clone();
        otel::inject(&Context::current(), &mut headers);

        let message = OutgoingMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload,
            properties: MessageProperties {
                content_type: JSON_CONTENT_TYPE.to_owned(),
                message_id: Some(
                    options
                        .message_id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                ),
                persistent: options.persistent,
                priority: options.priority,
                expiration: options.expiration,
                headers,
            },
        };

        let channel = self.channel().await?;
        match channel.basic_publish(&message).await {
            Ok(()) => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
            Err(err) => {
                if !channel.is_open() {
                    self.forget_channel(&channel).await;
                }
                Err(err)
            }
        }
    }

    /// Releases the channel. Later publishes fail with `ChannelClosed`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let channel = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.channel.take()
        };

        if let Some(channel) = channel {
            channel.close().await?;
        }

        debug!(exchange = self.exchange.name, "producer closed");
        Ok(())
    }
}

fn serialize<T>(payload: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::SerializePayloadError(err.to_string())
    })
}
