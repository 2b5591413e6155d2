// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the channel traits, with enough AMQP semantics for
//! end-to-end tests: direct/topic/fanout/headers routing, passive declares,
//! priority queues, per-message TTL with dead-lettering, QoS and redelivery.

#![allow(dead_code)]

use amqp_relay::{
    channel::{AmqpChannel, ChannelProvider, DeliveryStream},
    dispatcher::{HandlerError, MessageHandler},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{HeaderValue, Headers, IncomingMessage, OutgoingMessage},
    queue::{
        QueueBinding, QueueDefinition, QueueInfo, AMQP_ARG_DEAD_LETTER_EXCHANGE,
        AMQP_ARG_DEAD_LETTER_ROUTING_KEY, AMQP_ARG_MAX_PRIORITY,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

/// A message sitting in a queue.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    id: u64,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    pub persistent: bool,
    pub priority: Option<u8>,
    pub headers: Headers,
    pub expiration: Option<Duration>,
    pub redelivered: bool,
}

impl StoredMessage {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }
}

type Sender = mpsc::UnboundedSender<Result<IncomingMessage, AmqpError>>;

struct Subscription {
    tag: String,
    channel: u64,
    sender: Sender,
    in_flight: u32,
}

struct Queue {
    def: QueueDefinition,
    messages: VecDeque<StoredMessage>,
    subscriptions: Vec<Subscription>,
    next_subscription: usize,
    max_unacked: u32,
}

impl Queue {
    fn new(def: QueueDefinition) -> Queue {
        Queue {
            def,
            messages: VecDeque::new(),
            subscriptions: Vec::new(),
            next_subscription: 0,
            max_unacked: 0,
        }
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.def.name.clone(),
            message_count: self.messages.len() as u32,
            consumer_count: self.subscriptions.len() as u32,
        }
    }

    fn argument(&self, key: &str) -> Option<&HeaderValue> {
        self.def.arguments.get(key)
    }

    // highest priority first, FIFO within a priority
    fn next_position(&self) -> usize {
        let Some(max) = self.argument(AMQP_ARG_MAX_PRIORITY).and_then(HeaderValue::as_i64) else {
            return 0;
        };

        let mut best = 0;
        let mut best_priority = -1;
        for (pos, msg) in self.messages.iter().enumerate() {
            let priority = (msg.priority.unwrap_or(0) as i64).min(max);
            if priority > best_priority {
                best = pos;
                best_priority = priority;
            }
        }
        best
    }
}

struct Unacked {
    queue: String,
    channel: u64,
    consumer_tag: String,
    message: StoredMessage,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, Queue>,
    bindings: Vec<QueueBinding>,
    unacked: HashMap<u64, Unacked>,
    prefetch: HashMap<u64, u16>,
    dropped: Vec<StoredMessage>,
    next_id: u64,
    next_tag: u64,
    next_channel: u64,
    fail_publishes: u32,
}

/// Shared in-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').collect()
    };
    matches(&pattern, &key)
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    pub fn provider(&self) -> Arc<dyn ChannelProvider> {
        Arc::new(self.clone())
    }

    /// Creates a queue as if another service had declared it earlier.
    pub fn declare_queue(&self, name: &str, durable: bool) {
        let mut def = QueueDefinition::passive(name);
        def.passive = false;
        def.durable = durable;
        self.state
            .lock()
            .unwrap()
            .queues
            .insert(name.to_owned(), Queue::new(def));
    }

    /// Creates an exchange as if another service had declared it earlier.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.state
            .lock()
            .unwrap()
            .exchanges
            .insert(name.to_owned(), ExchangeDefinition::new(name).kind(kind));
    }

    pub fn queue_definition(&self, name: &str) -> Option<QueueDefinition> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(name)
            .map(|q| q.def.clone())
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().unwrap().exchanges.contains_key(name)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, key: &str) -> bool {
        self.state.lock().unwrap().bindings.iter().any(|b| {
            b.queue_name == queue && b.exchange_name == exchange && b.routing_key == key
        })
    }

    /// Messages waiting in `queue`, excluding unacknowledged ones.
    pub fn queue_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.queue_messages(queue).len()
    }

    /// Highest number of unacknowledged deliveries `queue` ever had outstanding.
    pub fn max_unacked(&self, queue: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.max_unacked)
            .unwrap_or_default()
    }

    pub fn unacked(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    /// Messages rejected or expired from queues without a dead-letter exchange.
    pub fn dropped(&self) -> Vec<StoredMessage> {
        self.state.lock().unwrap().dropped.clone()
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.lock().unwrap().fail_publishes = n;
    }

    fn route(
        state: &State,
        exchange: &str,
        routing_key: &str,
        headers: &Headers,
    ) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(state
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(def) = state.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError(exchange.to_owned()));
        };

        let mut queues: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let matched = match def.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Headers => binding
                    .arguments
                    .iter()
                    .filter(|(k, _)| !k.starts_with("x-"))
                    .all(|(k, v)| headers.get(k) == Some(v)),
            };

            if matched && !queues.contains(&binding.queue_name) {
                queues.push(binding.queue_name.clone());
            }
        }

        Ok(queues)
    }

    fn deliver(
        &self,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        mut message: StoredMessage,
    ) -> Result<(), AmqpError> {
        message.exchange = exchange.to_owned();
        message.routing_key = routing_key.to_owned();

        for queue in Self::route(state, exchange, routing_key, &message.headers)? {
            state.next_id += 1;
            let mut copy = message.clone();
            copy.id = state.next_id;
            self.enqueue(state, &queue, copy);
        }

        Ok(())
    }

    fn enqueue(&self, state: &mut State, queue_name: &str, message: StoredMessage) {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };

        if let Some(ttl) = message.expiration {
            let broker = self.clone();
            let queue = queue_name.to_owned();
            let id = message.id;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                broker.expire(&queue, id);
            });
        }

        queue.messages.push_back(message);
        Self::dispatch(state, queue_name);
    }

    fn expire(&self, queue_name: &str, id: u64) {
        let mut state = self.state.lock().unwrap();

        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let Some(pos) = queue.messages.iter().position(|m| m.id == id) else {
            return;
        };
        let Some(message) = queue.messages.remove(pos) else {
            return;
        };

        self.dead_letter(&mut state, queue_name, message);
    }

    fn dead_letter(&self, state: &mut State, queue_name: &str, mut message: StoredMessage) {
        let target = state.queues.get(queue_name).and_then(|q| {
            let exchange = q
                .argument(AMQP_ARG_DEAD_LETTER_EXCHANGE)
                .and_then(HeaderValue::as_str)?
                .to_owned();
            let key = q
                .argument(AMQP_ARG_DEAD_LETTER_ROUTING_KEY)
                .and_then(HeaderValue::as_str)
                .map(str::to_owned);
            Some((exchange, key))
        });

        let Some((exchange, key)) = target else {
            state.dropped.push(message);
            return;
        };

        let routing_key = key.unwrap_or_else(|| message.routing_key.clone());
        message.expiration = None;
        message.redelivered = false;

        if self
            .deliver(state, &exchange, &routing_key, message.clone())
            .is_err()
        {
            state.dropped.push(message);
        }
    }

    fn dispatch(state: &mut State, queue_name: &str) {
        loop {
            let tag = state.next_tag + 1;
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.subscriptions.is_empty() {
                return;
            }

            let count = queue.subscriptions.len();
            let chosen = (0..count)
                .map(|i| (queue.next_subscription + i) % count)
                .find(|idx| {
                    let sub = &queue.subscriptions[*idx];
                    let limit = state.prefetch.get(&sub.channel).copied().unwrap_or(0);
                    limit == 0 || sub.in_flight < limit as u32
                });
            let Some(idx) = chosen else {
                return;
            };

            let pos = queue.next_position();
            let Some(message) = queue.messages.remove(pos) else {
                return;
            };

            let delivery = IncomingMessage {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                payload: message.payload.clone(),
                message_id: message.message_id.clone(),
                persistent: message.persistent,
                priority: message.priority,
                headers: message.headers.clone(),
            };

            if queue.subscriptions[idx].sender.send(Ok(delivery)).is_err() {
                queue.subscriptions.remove(idx);
                queue.messages.insert(pos, message);
                continue;
            }

            queue.next_subscription = (idx + 1) % count;
            let sub = &mut queue.subscriptions[idx];
            sub.in_flight += 1;
            let consumer_tag = sub.tag.clone();
            let channel = sub.channel;

            let outstanding = queue.subscriptions.iter().map(|s| s.in_flight).sum();
            queue.max_unacked = queue.max_unacked.max(outstanding);

            state.next_tag = tag;
            state.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_owned(),
                    channel,
                    consumer_tag,
                    message,
                },
            );
        }
    }

    fn settle(state: &mut State, delivery_tag: u64) -> Option<Unacked> {
        let unacked = state.unacked.remove(&delivery_tag)?;

        if let Some(queue) = state.queues.get_mut(&unacked.queue) {
            if let Some(sub) = queue
                .subscriptions
                .iter_mut()
                .find(|s| s.tag == unacked.consumer_tag)
            {
                sub.in_flight = sub.in_flight.saturating_sub(1);
            }
        }

        Some(unacked)
    }
}

#[async_trait]
impl ChannelProvider for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.next_channel += 1;

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            id: state.next_channel,
            open: Arc::new(AtomicBool::new(true)),
        }))
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, AmqpError> {
        Ok(self.state.lock().unwrap().queues.contains_key(queue))
    }

    async fn exchange_exists(&self, exchange: &str) -> Result<bool, AmqpError> {
        Ok(exchange.is_empty() || self.has_exchange(exchange))
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelClosed);
        }
        Ok(self.broker.state.lock().unwrap())
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state()?;

        if let Some(existing) = state.exchanges.get(&def.name) {
            if existing.kind != def.kind || existing.durable != def.durable {
                return Err(AmqpError::DeclareExchangeError(def.name.clone()));
            }
            return Ok(());
        }

        state.exchanges.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        let mut state = self.state()?;

        if let Some(existing) = state.queues.get(&def.name) {
            if !def.passive
                && (existing.def.durable != def.durable
                    || existing.def.arguments != def.arguments)
            {
                return Err(AmqpError::DeclareQueueError(def.name.clone()));
            }
            return Ok(existing.info());
        }

        if def.passive {
            self.open.store(false, Ordering::SeqCst);
            return Err(AmqpError::DeclareQueueError(def.name.clone()));
        }

        let queue = Queue::new(def.clone());
        let info = queue.info();
        state.queues.insert(def.name.clone(), queue);
        Ok(info)
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state()?;

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.state()?.prefetch.insert(self.id, prefetch);
        Ok(())
    }

    async fn basic_publish(&self, message: &OutgoingMessage) -> Result<(), AmqpError> {
        let mut state = self.state()?;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(AmqpError::PublishingError(message.exchange.clone()));
        }

        let stored = StoredMessage {
            id: 0,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            payload: message.payload.clone(),
            message_id: message.properties.message_id.clone(),
            persistent: message.properties.persistent,
            priority: message.properties.priority,
            headers: message.properties.headers.clone(),
            expiration: message.properties.expiration,
            redelivered: false,
        };

        self.broker
            .deliver(&mut state, &message.exchange, &message.routing_key, stored)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };
        q.subscriptions.push(Subscription {
            tag: consumer_tag.to_owned(),
            channel: self.id,
            sender,
            in_flight: 0,
        });
        MemoryBroker::dispatch(&mut state, queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        let unacked =
            MemoryBroker::settle(&mut state, delivery_tag).ok_or(AmqpError::AckMessageError)?;
        MemoryBroker::dispatch(&mut state, &unacked.queue);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        let unacked =
            MemoryBroker::settle(&mut state, delivery_tag).ok_or(AmqpError::NackMessageError)?;

        if requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.messages.push_front(message);
            }
            MemoryBroker::dispatch(&mut state, &unacked.queue);
        } else {
            self.broker
                .dead_letter(&mut state, &unacked.queue, unacked.message);
            MemoryBroker::dispatch(&mut state, &unacked.queue);
        }

        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.state()?;
        for queue in state.queues.values_mut() {
            queue.subscriptions.retain(|s| s.tag != consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.broker.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            queue.subscriptions.retain(|s| s.channel != self.id);
        }

        let tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == self.id)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(message);
                }
                MemoryBroker::dispatch(&mut state, &unacked.queue);
            }
        }

        Ok(())
    }
}

/// A delivery observed by a [`Recorder`].
#[derive(Debug, Clone)]
pub struct Received {
    pub payload: Value,
    pub message: IncomingMessage,
    pub at: Instant,
}

/// Handler recording every delivery and failing on demand.
#[derive(Clone, Default)]
pub struct Recorder {
    received: Arc<Mutex<Vec<Received>>>,
    failures_left: Arc<AtomicUsize>,
    always_fail: Arc<AtomicBool>,
    processing_time: Option<Duration>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder::default()
    }

    /// Handler failing on every delivery.
    pub fn failing() -> Recorder {
        let recorder = Recorder::default();
        recorder.always_fail.store(true, Ordering::SeqCst);
        recorder
    }

    /// Handler failing the first `n` deliveries, then succeeding.
    pub fn failing_times(n: usize) -> Recorder {
        let recorder = Recorder::default();
        recorder.failures_left.store(n, Ordering::SeqCst);
        recorder
    }

    /// Each delivery takes `duration` to process.
    pub fn slow(mut self, duration: Duration) -> Recorder {
        self.processing_time = Some(duration);
        self
    }

    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(self.clone())
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, payload: Value, message: IncomingMessage) -> Result<(), HandlerError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        self.received.lock().unwrap().push(Received {
            payload,
            message,
            at: Instant::now(),
        });

        if let Some(duration) = self.processing_time {
            tokio::time::sleep(duration).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.always_fail.load(Ordering::SeqCst) {
            return Err("handler failure".into());
        }

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err("transient handler failure".into());
        }

        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` elapses on the tokio clock.
pub async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
