// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares groups of exchanges, queues and bindings in one pass. Two layouts are
//! built on top of it:
//!
//! - `RetryTopology`: the retry and dead-letter wiring of a consumed queue
//! - `DelayTopology`: the holding area used by producers to schedule messages
//!
//! Retry wiring for a queue `Q`:
//!
//! ```text
//!  failed msg ──▶ Q.retry (exchange) ──▶ Q.retry (queue, per-message TTL)
//!                                              │ expired
//!                                              ▼
//!        Q ◀── Q.dlx (dead-letter exchange, key Q)
//!
//!  retries exhausted ──▶ Q.dlq (parking queue)
//! ```

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::HeaderValue,
    queue::{
        QueueBinding, QueueDefinition, QueueOptions, AMQP_ARG_DEAD_LETTER_EXCHANGE,
        AMQP_ARG_DEAD_LETTER_ROUTING_KEY,
    },
};
use tracing::debug;

/// Ordered set of declarations installed on a channel.
///
/// `install` creates exchanges first, then queues, then bindings, so every binding
/// refers to entities that already exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares exchanges, then queues, then bindings.
    ///
    /// # Parameters
    /// * `channel` - Channel used for the declarations
    ///
    /// # Returns
    /// The first declaration error, if any
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            channel.exchange_declare(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        for queue in &self.queues {
            channel.queue_declare(queue).await?;
            debug!("queue: {} was created", queue.name);
        }

        for binding in &self.queues_binding {
            channel.queue_bind(binding).await?;
        }

        Ok(())
    }
}

/// Names of the retry and dead-letter entities serving one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTopology {
    pub queue: String,
    /// Routes messages leaving the retry queue back into `queue`.
    pub dead_letter_exchange: String,
    pub retry_exchange: String,
    /// Holding queue without consumers; messages wait out their TTL here.
    pub retry_queue: String,
    /// Receives messages whose retries are exhausted. `None` when the queue is
    /// missing from a topology this consumer did not declare.
    pub parking_queue: Option<String>,
}

impl RetryTopology {
    /// Conventional names for `queue`. The dead-letter exchange defaults to `<queue>.dlx`.
    pub fn for_queue(queue: &str, dead_letter_exchange: Option<&str>) -> RetryTopology {
        RetryTopology {
            queue: queue.to_owned(),
            dead_letter_exchange: dead_letter_exchange
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{queue}.dlx")),
            retry_exchange: format!("{queue}.retry"),
            retry_queue: format!("{queue}.retry"),
            parking_queue: Some(format!("{queue}.dlq")),
        }
    }

    /// Declarations creating the topology, durable when the main queue is.
    pub fn definition(&self, durable: bool) -> AmqpTopology {
        let retry_queue = QueueDefinition::new(&self.retry_queue, &QueueOptions::new().durable(durable))
            .argument(
                AMQP_ARG_DEAD_LETTER_EXCHANGE,
                HeaderValue::from(self.dead_letter_exchange.as_str()),
            )
            .argument(
                AMQP_ARG_DEAD_LETTER_ROUTING_KEY,
                HeaderValue::from(self.queue.as_str()),
            );

        let topology = AmqpTopology::new()
            .exchange(
                ExchangeDefinition::new(&self.dead_letter_exchange)
                    .direct()
                    .durable(durable),
            )
            .exchange(
                ExchangeDefinition::new(&self.retry_exchange)
                    .direct()
                    .durable(durable),
            )
            .queue(retry_queue)
            .queue_binding(
                QueueBinding::new(&self.queue)
                    .exchange(&self.dead_letter_exchange)
                    .routing_key(&self.queue),
            )
            .queue_binding(
                QueueBinding::new(&self.retry_queue)
                    .exchange(&self.retry_exchange)
                    .routing_key(&self.queue),
            );

        match self.parking_queue.as_deref() {
            Some(parking_queue) => topology.queue(QueueDefinition::new(
                parking_queue,
                &QueueOptions::new().durable(durable),
            )),
            None => topology,
        }
    }
}

/// Holding area used to schedule messages of one exchange.
///
/// Scheduled messages are published to the fanout exchange `<exchange>.delay` with a
/// per-message TTL. The bound queue has no consumers and dead-letters expired
/// messages into `<exchange>`, keeping their original routing key. The broker only
/// expires messages at the head of a queue, so a short delay queued behind a
/// longer one is released late.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayTopology {
    pub target_exchange: String,
    pub delay_exchange: String,
    pub delay_queue: String,
}

impl DelayTopology {
    /// Names derived from `exchange`.
    pub fn for_exchange(exchange: &str) -> DelayTopology {
        DelayTopology {
            target_exchange: exchange.to_owned(),
            delay_exchange: format!("{exchange}.delay"),
            delay_queue: format!("{exchange}.delay"),
        }
    }

    /// Declarations creating the delay exchange and its holding queue.
    pub fn definition(&self, durable: bool) -> AmqpTopology {
        AmqpTopology::new()
            .exchange(
                ExchangeDefinition::new(&self.delay_exchange)
                    .fanout()
                    .durable(durable),
            )
            .queue(
                QueueDefinition::new(&self.delay_queue, &QueueOptions::new().durable(durable))
                    .argument(
                        AMQP_ARG_DEAD_LETTER_EXCHANGE,
                        HeaderValue::from(self.target_exchange.as_str()),
                    ),
            )
            .queue_binding(
                QueueBinding::new(&self.delay_queue).exchange(&self.delay_exchange),
            )
    }
}
