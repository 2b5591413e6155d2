// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatch
//!
//! Runs the delivery loop of a consumer subscription. Each delivery is handed to a
//! tokio task; a semaphore sized to the prefetch count bounds how many handlers run
//! at once, matching the broker's QoS window.
//!
//! Per delivery the dispatcher:
//! 1. decodes the JSON payload and reads the retry count from the headers
//! 2. runs the handler inside a consumer trace span
//! 3. acknowledges on success
//! 4. on failure applies the [`FailurePolicy`]: delayed retry through the retry
//!    exchange, immediate requeue, or discard
//!
//! Handler failures and panics never escape the loop.

use crate::{
    channel::{AmqpChannel, DeliveryStream},
    errors::AmqpError,
    message::{
        HeaderValue, IncomingMessage, MessageProperties, OutgoingMessage, HEADER_DISCARD_REASON,
        HEADER_LAST_ERROR, JSON_CONTENT_TYPE,
    },
    otel,
    retry::{retry_count, retry_headers, DiscardReason, FailureAction, FailurePolicy},
    topology::RetryTopology,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde_json::Value;
use std::{borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, warn};

/// Error returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes decoded messages of a consumer subscription.
///
/// Up to `prefetch` invocations may run concurrently, so implementations must be
/// safe to call in parallel. Returning an error hands the message to the failure
/// policy of the subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Value, message: IncomingMessage) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wraps an async closure as a [`MessageHandler`].
///
/// ```rust,ignore
/// let handler = handler_fn(|payload, _msg| async move {
///     println!("{payload}");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Value, IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value, IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Value, message: IncomingMessage) -> Result<(), HandlerError> {
        (self.0)(payload, message).await
    }
}

/// Applies handler outcomes of one subscription back onto its channel.
pub(crate) struct Dispatcher {
    pub(crate) channel: Arc<dyn AmqpChannel>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) queue: String,
    pub(crate) policy: FailurePolicy,
    pub(crate) topology: Option<RetryTopology>,
}

impl Dispatcher {
    pub(crate) async fn dispatch(&self, message: IncomingMessage) -> Result<(), AmqpError> {
        let tracer = global::tracer("amqp consumer");
        let mut span = otel::new_span(&message.headers, &tracer, &self.queue);

        let count = retry_count(&message.headers);
        debug!(
            queue = self.queue,
            delivery_tag = message.delivery_tag,
            retry_count = count,
            "received message"
        );

        let outcome = match serde_json::from_slice::<Value>(&message.payload) {
            Ok(payload) => {
                match AssertUnwindSafe(self.handler.handle(payload, message.clone()))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::from("handler panicked")),
                }
            }
            Err(err) => Err(HandlerError::from(format!("failure to parse payload: {err}"))),
        };

        match outcome {
            Ok(()) => {
                debug!("message successfully processed");
                match self.channel.basic_ack(message.delivery_tag).await {
                    Err(e) => {
                        span.record_error(&e);
                        span.set_status(Status::Error {
                            description: Cow::from("error to ack msg"),
                        });
                        Err(e)
                    }
                    _ => {
                        span.set_status(Status::Ok);
                        Ok(())
                    }
                }
            }
            Err(err) => {
                span.record_error(err.as_ref());
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                self.on_failure(&message, count, err.as_ref()).await
            }
        }
    }

    async fn on_failure(
        &self,
        message: &IncomingMessage,
        count: u32,
        err: &(dyn std::error::Error + Send + Sync),
    ) -> Result<(), AmqpError> {
        match self.policy.decide(count) {
            FailureAction::Retry { attempt, delay } => {
                self.schedule_retry(message, attempt, delay, err).await
            }
            FailureAction::Requeue => {
                warn!(
                    queue = self.queue,
                    error = err.to_string(),
                    "error whiling handling msg, requeuing"
                );
                self.channel
                    .basic_nack(message.delivery_tag, true)
                    .await
                    .map_err(|_| AmqpError::NackMessageError)
            }
            FailureAction::Discard { reason } => self.discard(message, count, reason, err).await,
        }
    }

    async fn schedule_retry(
        &self,
        message: &IncomingMessage,
        attempt: u32,
        delay: std::time::Duration,
        err: &(dyn std::error::Error + Send + Sync),
    ) -> Result<(), AmqpError> {
        let Some(topology) = self.topology.as_ref() else {
            return Err(AmqpError::InternalError);
        };

        warn!(
            queue = self.queue,
            attempt,
            max_retries = self.policy.retry.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = err.to_string(),
            "error whiling handling msg, scheduling retry"
        );

        let retry = OutgoingMessage {
            exchange: topology.retry_exchange.clone(),
            routing_key: topology.queue.clone(),
            payload: message.payload.clone(),
            properties: MessageProperties {
                content_type: JSON_CONTENT_TYPE.to_owned(),
                message_id: message.message_id.clone(),
                persistent: message.persistent,
                priority: message.priority,
                expiration: Some(delay),
                headers: retry_headers(message, attempt),
            },
        };

        if let Err(e) = self.channel.basic_publish(&retry).await {
            error!(error = e.to_string(), "error whiling sending to retry, requeuing");
            self.channel.basic_nack(message.delivery_tag, true).await?;
            return Err(AmqpError::PublishingToRetryError(
                topology.retry_exchange.clone(),
            ));
        }

        // the copy now lives in the retry queue
        self.channel.basic_ack(message.delivery_tag).await
    }

    async fn discard(
        &self,
        message: &IncomingMessage,
        count: u32,
        reason: DiscardReason,
        err: &(dyn std::error::Error + Send + Sync),
    ) -> Result<(), AmqpError> {
        let parking_queue = self
            .topology
            .as_ref()
            .and_then(|topology| topology.parking_queue.as_ref());

        if let Some(parking_queue) = parking_queue {
            let mut headers = retry_headers(message, count);
            headers.insert(
                HEADER_DISCARD_REASON.to_owned(),
                HeaderValue::from(reason.as_str()),
            );
            headers.insert(HEADER_LAST_ERROR.to_owned(), HeaderValue::from(err.to_string()));

            let parked = OutgoingMessage {
                exchange: String::new(),
                routing_key: parking_queue.clone(),
                payload: message.payload.clone(),
                properties: MessageProperties {
                    content_type: JSON_CONTENT_TYPE.to_owned(),
                    message_id: message.message_id.clone(),
                    persistent: message.persistent,
                    priority: message.priority,
                    expiration: None,
                    headers,
                },
            };

            error!(
                queue = self.queue,
                dlq = parking_queue,
                retry_count = count,
                reason = reason.as_str(),
                error = err.to_string(),
                "too many attempts, sending to dlq"
            );

            if let Err(e) = self.channel.basic_publish(&parked).await {
                error!(error = e.to_string(), "error whiling sending to dlq");
                self.channel.basic_nack(message.delivery_tag, true).await?;
                return Err(AmqpError::PublishingToDQLError(parking_queue.clone()));
            }
        } else {
            error!(
                queue = self.queue,
                delivery_tag = message.delivery_tag,
                retry_count = count,
                reason = reason.as_str(),
                error = err.to_string(),
                "discarding message"
            );
        }

        self.channel.basic_ack(message.delivery_tag).await
    }
}

/// Spawns the delivery loop of a subscription.
///
/// The loop ends when the stream ends (subscription cancelled or channel closed);
/// it then waits for in-flight handlers before finishing.
pub(crate) fn spawn_delivery_loop(
    dispatcher: Arc<Dispatcher>,
    mut stream: DeliveryStream,
    prefetch: u16,
) -> JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(prefetch as usize));

    tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(message) => {
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };

                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = dispatcher.dispatch(message).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    });
                }

                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        let _ = permits.acquire_many(prefetch as u32).await;
        debug!(queue = dispatcher.queue, "delivery loop finished");
    })
}
