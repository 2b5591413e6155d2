// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! The `AmqpError` enum represents every failure the relay can surface: connection
//! and channel problems, topology declarations, publishing, consumer lifecycle and
//! configuration. Handler failures are not part of this enum; they are converted
//! into retry, requeue or discard by the dispatcher and never escape the consume loop.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error loading the connection configuration
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel or its connection is no longer usable
    #[error("channel closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message to its retry exchange
    #[error("failure to publish to retry exchange `{0}`")]
    PublishingToRetryError(String),

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq `{0}`")]
    PublishingToDQLError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error delivered by the broker on an active subscription
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// An operation was invoked in a phase that no longer allows it
    #[error("invalid consumer state: `{0}`")]
    InvalidState(String),
}
