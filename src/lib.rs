// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod priority;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod topology;

pub use channel::{AmqpChannel, ChannelProvider, ConnectionManager};
pub use config::AmqpConfig;
pub use consumer::{create_bound_consumer, create_consumer, ConsumeOptions, Consumer};
pub use dispatcher::{handler_fn, HandlerError, MessageHandler};
pub use errors::AmqpError;
pub use exchange::ExchangeKind;
pub use priority::setup_priority_queue;
pub use producer::{create_producer, Producer, PublishOptions, PublishRetryPolicy};
pub use queue::QueueOptions;
pub use retry::RetryConfig;
