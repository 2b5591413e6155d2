// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! A `Consumer` owns one queue subscription and moves through a fixed sequence of
//! phases:
//!
//! ```text
//! Uninitialized → Initialized → Bound → RetryConfigured → Consuming → Stopped
//! ```
//!
//! Transitions consume the value and hand it back, so a consumer can never be
//! observed half-configured. `close` consumes it for good. Every transition lazily
//! runs `initialize` first.
//!
//! Queues are probed before they are declared: a queue that already exists is only
//! asserted passively and keeps its configuration, whatever options were requested.

use crate::{
    channel::{AmqpChannel, ChannelProvider},
    dispatcher::{spawn_delivery_loop, Dispatcher, MessageHandler},
    errors::AmqpError,
    message::Headers,
    queue::{QueueBinding, QueueDefinition, QueueOptions},
    retry::{FailurePolicy, RetryConfig},
    topology::RetryTopology,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle phase of a [`Consumer`]. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConsumerPhase {
    Uninitialized,
    Initialized,
    Bound,
    RetryConfigured,
    Consuming,
    Stopped,
}

/// Subscription options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries, and concurrently running handlers.
    pub prefetch: u16,
    /// Requeue failed messages when no retry path is available.
    pub requeue: bool,
    /// Defaults to `<queue>-<uuid>`.
    pub consumer_tag: Option<String>,
    pub exclusive: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            prefetch: 10,
            requeue: true,
            consumer_tag: None,
            exclusive: false,
        }
    }
}

impl ConsumeOptions {
    /// Default options: prefetch 10, requeue on failure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of unacknowledged deliveries, and of handlers running at once.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Whether failed messages go back to the queue when retry is not available.
    pub fn requeue(mut self, requeue: bool) -> Self {
        self.requeue = requeue;
        self
    }

    /// Fixed consumer tag. Defaults to `<queue>-<uuid>`.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// Requests exclusive access to the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Read-only view of a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerState {
    pub queue_name: String,
    pub queue_options: QueueOptions,
    pub retry_config: RetryConfig,
    /// The queue existed before this consumer initialized; its configuration was
    /// left untouched.
    pub queue_exists: bool,
    pub phase: ConsumerPhase,
    pub bindings: Vec<QueueBinding>,
    /// Retry wiring used on handler failures, when attached.
    pub retry_topology: Option<RetryTopology>,
    pub consumer_tag: Option<String>,
}

/// Consumes one queue over a dedicated channel.
pub struct Consumer {
    provider: Arc<dyn ChannelProvider>,
    channel: Option<Arc<dyn AmqpChannel>>,
    state: ConsumerState,
    delivery_loop: Option<JoinHandle<()>>,
}

/// Creates a consumer for `queue`. Nothing is declared until the first transition.
///
/// # Parameters
/// * `provider` - Source of channels and existence probes
/// * `queue` - Name of the queue to consume
/// * `options` - Options applied if the queue has to be declared
///
/// # Returns
/// An uninitialized Consumer
pub fn create_consumer(
    provider: Arc<dyn ChannelProvider>,
    queue: &str,
    options: QueueOptions,
) -> Consumer {
    Consumer::new(provider, queue, options)
}

/// Creates a consumer for `queue` and binds it to `exchange` with `binding_key`.
///
/// # Parameters
/// * `provider` - Source of channels and existence probes
/// * `queue` - Name of the queue to consume
/// * `exchange` - Exchange the queue is bound to
/// * `binding_key` - Binding key, topic patterns allowed
/// * `options` - Options applied if the queue has to be declared
///
/// # Returns
/// A Consumer in the `Bound` phase
pub async fn create_bound_consumer(
    provider: Arc<dyn ChannelProvider>,
    queue: &str,
    exchange: &str,
    binding_key: &str,
    options: QueueOptions,
) -> Result<Consumer, AmqpError> {
    Consumer::new(provider, queue, options)
        .bind_queue(exchange, binding_key, Headers::new())
        .await
}

impl Consumer {
    /// Same as [`create_consumer`].
    pub fn new(provider: Arc<dyn ChannelProvider>, queue: &str, options: QueueOptions) -> Consumer {
        Consumer {
            provider,
            channel: None,
            state: ConsumerState {
                queue_name: queue.to_owned(),
                queue_options: options,
                retry_config: RetryConfig::default(),
                queue_exists: false,
                phase: ConsumerPhase::Uninitialized,
                bindings: Vec::new(),
                retry_topology: None,
                consumer_tag: None,
            },
            delivery_loop: None,
        }
    }

    /// Replaces the retry configuration. Takes effect on the next `consume`.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.state.retry_config = retry;
        self
    }

    /// Read-only view of the consumer state.
    ///
    /// # Returns
    /// The queue settings, phase, bindings and attached retry topology
    pub fn state(&self) -> &ConsumerState {
        &self.state
    }

    pub fn queue_name(&self) -> &str {
        &self.state.queue_name
    }

    fn advance(&mut self, phase: ConsumerPhase) {
        self.state.phase = self.state.phase.max(phase);
    }

    fn ensure_before(&self, phase: ConsumerPhase, operation: &str) -> Result<(), AmqpError> {
        if self.state.phase >= phase {
            return Err(AmqpError::InvalidState(format!(
                "cannot {operation} queue {} while {:?}",
                self.state.queue_name, self.state.phase
            )));
        }
        Ok(())
    }

    fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.channel.clone().ok_or(AmqpError::ChannelClosed)
    }

    /// Opens the channel and makes sure the queue exists.
    ///
    /// An existing queue is asserted passively and marked `queue_exists`; the
    /// requested options are not applied to it. A missing queue is declared with
    /// the options.
    ///
    /// # Returns
    /// The consumer in the `Initialized` phase, or the declare error
    pub async fn initialize(mut self) -> Result<Self, AmqpError> {
        if self.state.phase >= ConsumerPhase::Initialized {
            return Ok(self);
        }

        let channel = self.provider.open_channel().await?;
        let queue = self.state.queue_name.clone();

        if self.provider.queue_exists(&queue).await? {
            let info = channel
                .queue_declare(&QueueDefinition::passive(&queue))
                .await?;
            warn!(
                queue,
                messages = info.message_count,
                consumers = info.consumer_count,
                "queue already exists, keeping its configuration"
            );
            self.state.queue_exists = true;
        } else {
            channel
                .queue_declare(&QueueDefinition::new(&queue, &self.state.queue_options))
                .await?;
            debug!(queue, durable = self.state.queue_options.durable, "queue declared");
            self.state.queue_exists = false;
        }

        self.channel = Some(channel);
        self.advance(ConsumerPhase::Initialized);
        Ok(self)
    }

    /// Binds the queue to `exchange`. Binding keys are passed through untouched, so
    /// topic patterns work. Repeating a binding is a no-op.
    ///
    /// # Parameters
    /// * `exchange` - Exchange to bind to
    /// * `binding_key` - Routing or topic pattern
    /// * `arguments` - Binding arguments, used by headers exchanges
    ///
    /// # Returns
    /// The bound consumer, or `InvalidState` once consuming has started
    pub async fn bind_queue(
        self,
        exchange: &str,
        binding_key: &str,
        arguments: Headers,
    ) -> Result<Self, AmqpError> {
        let mut this = self.initialize().await?;
        this.ensure_before(ConsumerPhase::Consuming, "bind")?;

        let binding = QueueBinding::new(&this.state.queue_name)
            .exchange(exchange)
            .routing_key(binding_key)
            .arguments(arguments);

        if this.state.bindings.contains(&binding) {
            debug!(queue = this.state.queue_name, exchange, binding_key, "binding already in place");
            return Ok(this);
        }

        this.channel()?.queue_bind(&binding).await?;
        this.state.bindings.push(binding);
        this.advance(ConsumerPhase::Bound);
        Ok(this)
    }

    /// Wires the retry and dead-letter topology of the queue.
    ///
    /// Does nothing when retry is disabled. For a queue that existed before, nothing
    /// is declared: the retry path is attached only if `<queue>.retry` already
    /// exists, and exhausted messages are parked only if `<queue>.dlq` does.
    ///
    /// # Returns
    /// The consumer, in `RetryConfigured` when a retry path was attached
    pub async fn setup_retry_queue(self) -> Result<Self, AmqpError> {
        let mut this = self.initialize().await?;
        this.ensure_before(ConsumerPhase::Consuming, "configure retries for")?;

        if !this.state.retry_config.enabled {
            debug!(queue = this.state.queue_name, "retry disabled, skipping retry topology");
            return Ok(this);
        }

        if this.state.retry_topology.is_some() {
            return Ok(this);
        }

        let mut topology = RetryTopology::for_queue(
            &this.state.queue_name,
            this.state.queue_options.dead_letter_exchange.as_deref(),
        );

        if this.state.queue_exists {
            if !this.provider.exchange_exists(&topology.retry_exchange).await? {
                warn!(
                    queue = this.state.queue_name,
                    retry_exchange = topology.retry_exchange,
                    "queue pre-exists without retry exchange, retries disabled"
                );
                return Ok(this);
            }
            if let Some(parking_queue) = topology.parking_queue.take() {
                if this.provider.queue_exists(&parking_queue).await? {
                    topology.parking_queue = Some(parking_queue);
                } else {
                    warn!(
                        queue = this.state.queue_name,
                        dlq = parking_queue,
                        "dlq missing, exhausted messages will be discarded"
                    );
                }
            }
            debug!(queue = this.state.queue_name, "reusing existing retry topology");
        } else {
            topology
                .definition(this.state.queue_options.durable)
                .install(this.channel()?.as_ref())
                .await?;
            debug!(
                queue = this.state.queue_name,
                retry_queue = topology.retry_queue,
                dlq = ?topology.parking_queue,
                "retry topology declared"
            );
        }

        this.state.retry_topology = Some(topology);
        this.advance(ConsumerPhase::RetryConfigured);
        Ok(this)
    }

    /// Subscribes `handler` to the queue.
    ///
    /// Sets QoS to `prefetch` and runs at most `prefetch` handlers at once. When
    /// retry is enabled the retry topology is set up first if it was not already.
    ///
    /// # Parameters
    /// * `handler` - Handler invoked with the decoded JSON payload of each delivery
    /// * `options` - Prefetch, requeue and subscription settings
    ///
    /// # Returns
    /// The consumer in the `Consuming` phase. `ConfigurationError` when prefetch is zero.
    pub async fn consume(
        self,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<Self, AmqpError> {
        if options.prefetch == 0 {
            return Err(AmqpError::ConfigurationError(
                "prefetch must be greater than zero".to_owned(),
            ));
        }

        let mut this = self.initialize().await?;
        this.ensure_before(ConsumerPhase::Consuming, "consume")?;

        if this.state.retry_config.enabled && this.state.retry_topology.is_none() {
            this = this.setup_retry_queue().await?;
        }

        let channel = this.channel()?;
        let queue = this.state.queue_name.clone();

        channel.basic_qos(options.prefetch).await?;

        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{queue}-{}", Uuid::new_v4()));

        let stream = channel
            .basic_consume(&queue, &tag, options.exclusive)
            .await?;

        let dispatcher = Dispatcher {
            channel,
            handler,
            queue: queue.clone(),
            policy: FailurePolicy {
                retry: this.state.retry_config.clone(),
                retry_available: this.state.retry_topology.is_some(),
                requeue: options.requeue,
            },
            topology: this.state.retry_topology.clone(),
        };

        this.delivery_loop = Some(spawn_delivery_loop(
            Arc::new(dispatcher),
            stream,
            options.prefetch,
        ));

        debug!(queue, consumer_tag = tag, prefetch = options.prefetch, "consuming");
        this.state.consumer_tag = Some(tag);
        this.advance(ConsumerPhase::Consuming);
        Ok(this)
    }

    /// Cancels the subscription and waits for in-flight handlers to finish. The
    /// channel stays open. Does nothing unless consuming.
    ///
    /// # Returns
    /// The stopped consumer. When the broker refuses the cancel, the delivery loop
    /// is aborted, the channel is closed and the cancel error is returned.
    pub async fn stop_consuming(mut self) -> Result<Self, AmqpError> {
        if let Err(err) = self.halt().await {
            if let Some(channel) = self.channel.take() {
                if let Err(close_err) = channel.close().await {
                    warn!(error = close_err.to_string(), "error closing channel after failed cancel");
                }
            }
            return Err(err);
        }

        Ok(self)
    }

    /// Stops consuming if needed and closes the channel.
    ///
    /// The channel is closed even when cancelling the subscription fails; the first
    /// error is returned.
    pub async fn close(mut self) -> Result<(), AmqpError> {
        let stopped = self.halt().await;

        let closed = match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };

        debug!(queue = self.state.queue_name, "consumer closed");
        stopped.and(closed)
    }

    async fn halt(&mut self) -> Result<(), AmqpError> {
        if self.state.phase != ConsumerPhase::Consuming {
            return Ok(());
        }

        let cancelled = match (self.state.consumer_tag.as_deref(), self.channel.as_ref()) {
            (Some(tag), Some(channel)) => channel.basic_cancel(tag).await,
            _ => Ok(()),
        };

        if let Some(delivery_loop) = self.delivery_loop.take() {
            if let Err(err) = &cancelled {
                // the stream never ends without a cancel
                error!(
                    queue = self.state.queue_name,
                    error = err.to_string(),
                    "error cancelling consumer, aborting delivery loop"
                );
                delivery_loop.abort();
            }

            match delivery_loop.await {
                Err(err) if !err.is_cancelled() => {
                    error!(error = err.to_string(), "delivery loop aborted")
                }
                _ => {}
            }
        }

        debug!(queue = self.state.queue_name, "consumer stopped");
        self.advance(ConsumerPhase::Stopped);
        cancelled
    }
}
