// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module owns the single broker connection of the process and hands out one
//! channel per producer or consumer. Two traits form the seam between the relay and
//! the broker client:
//!
//! - `ChannelProvider`: opens channels and probes whether queues or exchanges exist
//! - `AmqpChannel`: the channel operations producers and consumers rely on
//!
//! `ConnectionManager` and `LapinChannel` implement them on top of `lapin`.

use crate::{
    config::AmqpConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{
        from_field_table, to_field_table, IncomingMessage, OutgoingMessage,
        DELIVERY_MODE_PERSISTENT, DELIVERY_MODE_TRANSIENT,
    },
    queue::{QueueBinding, QueueDefinition, QueueInfo},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Stream of deliveries for one consumer subscription. It ends when the
/// subscription is cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<IncomingMessage, AmqpError>>;

/// Channel operations used by producers and consumers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Whether the channel and its connection are still usable.
    fn is_open(&self) -> bool;

    /// Declares an exchange. Redeclaring with identical settings is a no-op.
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Caps the number of unacknowledged deliveries per consumer on this channel.
    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn basic_publish(&self, message: &OutgoingMessage) -> Result<(), AmqpError>;

    /// Subscribes to `queue` with manual acknowledgement.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Source of channels multiplexed over a shared connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Checks whether `queue` exists without declaring or modifying it.
    async fn queue_exists(&self, queue: &str) -> Result<bool, AmqpError>;

    /// Checks whether `exchange` exists without declaring or modifying it.
    async fn exchange_exists(&self, exchange: &str) -> Result<bool, AmqpError>;
}

/// Owns the lazily established broker connection of the process.
pub struct ConnectionManager {
    config: AmqpConfig,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionManager {
    /// Creates a manager. No connection is made until the first channel is requested.
    ///
    /// # Parameters
    /// * `config` - Broker address and credentials
    ///
    /// # Returns
    /// A shareable ConnectionManager
    pub fn new(config: AmqpConfig) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager {
            config,
            connection: Mutex::new(None),
        })
    }

    /// Returns the shared connection, connecting first if needed.
    pub async fn connect(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            warn!("amqp connection lost, reconnecting");
        }

        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.config.connection_name.clone()));

        let conn = match Connection::connect(&self.config.uri(), options).await {
            Ok(c) => Ok(Arc::new(c)),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn raw_channel(&self) -> Result<Channel, AmqpError> {
        let conn = self.connect().await?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(c) => {
                debug!(channel = c.id(), "channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Closes the connection and every channel on it. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let Some(conn) = self.connection.lock().await.take() else {
            return Ok(());
        };

        if !conn.status().connected() {
            return Ok(());
        }

        match conn.close(REPLY_SUCCESS, "shutdown").await {
            Ok(_) => {
                debug!("amqp connection closed");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error closing the connection");
                Err(AmqpError::ConnectionError)
            }
        }
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp_err) => matches!(
            amqp_err.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)
        ),
        _ => false,
    }
}

#[async_trait]
impl ChannelProvider for ConnectionManager {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = self.raw_channel().await?;
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    // A failed passive declare closes the channel that issued it, so probes run on
    // a throwaway channel.
    async fn queue_exists(&self, queue: &str) -> Result<bool, AmqpError> {
        let channel = self.raw_channel().await?;

        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };

        match channel
            .queue_declare(queue, options, FieldTable::default())
            .await
        {
            Ok(_) => {
                let _ = channel.close(REPLY_SUCCESS, "probe done").await;
                Ok(true)
            }
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to probe queue");
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
        }
    }

    async fn exchange_exists(&self, exchange: &str) -> Result<bool, AmqpError> {
        let channel = self.raw_channel().await?;

        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };

        match channel
            .exchange_declare(
                exchange,
                lapin::ExchangeKind::Direct,
                options,
                FieldTable::default(),
            )
            .await
        {
            Ok(_) => {
                let _ = channel.close(REPLY_SUCCESS, "probe done").await;
                Ok(true)
            }
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => {
                error!(error = err.to_string(), exchange, "failure to probe exchange");
                Err(AmqpError::DeclareExchangeError(exchange.to_owned()))
            }
        }
    }
}

static SHARED: OnceLock<Arc<ConnectionManager>> = OnceLock::new();

/// Returns the process-wide connection manager, creating it with `config` on first
/// use. Later calls ignore `config`.
pub fn shared(config: &AmqpConfig) -> Arc<ConnectionManager> {
    SHARED
        .get_or_init(|| ConnectionManager::new(config.clone()))
        .clone()
}

/// Closes the process-wide connection. Meant to run during shutdown.
pub async fn close_shared() -> Result<(), AmqpError> {
    match SHARED.get() {
        Some(manager) => manager.close().await,
        None => Ok(()),
    }
}

/// `AmqpChannel` backed by a lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    /// Wraps an open lapin channel.
    pub fn new(channel: Channel) -> LapinChannel {
        LapinChannel { channel }
    }
}

fn to_incoming(delivery: Delivery) -> IncomingMessage {
    let props = &delivery.properties;

    IncomingMessage {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        message_id: props.message_id().as_ref().map(|id| id.to_string()),
        persistent: *props.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        priority: *props.priority(),
        headers: from_field_table(props.headers().as_ref()),
        payload: delivery.data,
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!(name = def.name, kind = def.kind.as_str(), "declaring exchange");

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        debug!(name = def.name, passive = def.passive, "declaring queue");

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                to_field_table(&def.arguments),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(QueueInfo {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                to_field_table(&binding.arguments),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish(&self, message: &OutgoingMessage) -> Result<(), AmqpError> {
        let props = &message.properties;

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(props.content_type.as_str()))
            .with_delivery_mode(if props.persistent {
                DELIVERY_MODE_PERSISTENT
            } else {
                DELIVERY_MODE_TRANSIENT
            })
            .with_headers(to_field_table(&props.headers));

        if let Some(id) = &props.message_id {
            properties = properties.with_message_id(ShortString::from(id.as_str()));
        }

        if let Some(priority) = props.priority {
            properties = properties.with_priority(priority);
        }

        if let Some(expiration) = props.expiration {
            properties = properties
                .with_expiration(ShortString::from(expiration.as_millis().to_string()));
        }

        match self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = message.exchange,
                    "error publishing message"
                );
                Err(AmqpError::PublishingError(message.exchange.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(to_incoming)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error cancelling consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error closing the channel");
                AmqpError::ChannelError
            })
    }
}
