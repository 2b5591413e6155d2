// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing queue declarations and queue-to-exchange bindings. Queue options
//! are translated into the `x-*` declaration arguments understood by RabbitMQ
//! (priority support, dead-lettering, TTL and length limits).

use crate::message::{HeaderValue, Headers};
use std::time::Duration;

/// Declaration argument naming the exchange rejected or expired messages go to
pub const AMQP_ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Declaration argument overriding the routing key of dead-lettered messages
pub const AMQP_ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Declaration argument for the queue-wide message TTL
pub const AMQP_ARG_MESSAGE_TTL: &str = "x-message-ttl";
/// Declaration argument for the maximum queue length
pub const AMQP_ARG_MAX_LENGTH: &str = "x-max-length";
/// Declaration argument for the maximum queue size in bytes
pub const AMQP_ARG_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Declaration argument enabling priority support
pub const AMQP_ARG_MAX_PRIORITY: &str = "x-max-priority";

/// Options applied when this process declares a queue.
///
/// Options are ignored when the queue already exists: the existing configuration
/// always wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Highest priority the queue honours (1-255). `None` disables priorities.
    pub max_priority: Option<u8>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
    pub max_length: Option<u32>,
    pub max_length_bytes: Option<u32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            max_priority: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
            max_length: None,
            max_length_bytes: None,
        }
    }
}

impl QueueOptions {
    /// Durable, non-exclusive queue without extra arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the queue survives broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Deletes the queue once its last consumer unsubscribes.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Enables priorities up to `max` (`x-max-priority`).
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Routes rejected and expired messages to `exchange`.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    /// Expires messages after `ttl` (`x-message-ttl`).
    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// When the limit is reached the oldest messages are dropped or dead-lettered.
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: u32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Declaration arguments derived from the options.
    pub fn arguments(&self) -> Headers {
        let mut args = Headers::new();

        if let Some(max) = self.max_priority {
            args.insert(AMQP_ARG_MAX_PRIORITY.to_owned(), HeaderValue::Int(max as i64));
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                AMQP_ARG_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::from(exchange.as_str()),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                AMQP_ARG_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::from(key.as_str()),
            );
        }

        if let Some(ttl) = self.message_ttl {
            args.insert(
                AMQP_ARG_MESSAGE_TTL.to_owned(),
                HeaderValue::Int(ttl.as_millis() as i64),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_ARG_MAX_LENGTH.to_owned(), HeaderValue::from(max));
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                AMQP_ARG_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::from(max_bytes),
            );
        }

        args
    }
}

/// A queue declaration as sent to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub name: String,
    /// Only checks that the queue exists, leaving its configuration untouched.
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Headers,
}

impl QueueDefinition {
    /// Declaration creating `name` with the given options.
    pub fn new(name: &str, options: &QueueOptions) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            arguments: options.arguments(),
        }
    }

    /// Assertion of an existing queue, carrying no options.
    pub fn passive(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            passive: true,
            durable: false,
            exclusive: false,
            auto_delete: false,
            arguments: Headers::new(),
        }
    }

    /// Adds a raw declaration argument.
    pub fn argument(mut self, key: &str, value: HeaderValue) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }
}

/// Broker answer to a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub arguments: Headers,
}

impl QueueBinding {
    /// Creates a binding for `queue` with an empty exchange name and routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            arguments: Headers::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Binding key; topic exchanges accept `*` and `#` wildcards.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Binding arguments, used by headers exchanges.
    pub fn arguments(mut self, arguments: Headers) -> Self {
        self.arguments = arguments;
        self
    }
}
