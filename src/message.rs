// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Broker-independent representation of published and delivered messages, and the
//! header names that carry retry metadata between the dispatcher and the retry path.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::{collections::BTreeMap, time::Duration};

/// Number of times the message has been handed to the retry path.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Exchange the message was first published to.
pub const HEADER_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Routing key the message was first published with.
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Why a parked message left its queue.
pub const HEADER_DISCARD_REASON: &str = "x-discard-reason";
/// Last handler error of a parked message.
pub const HEADER_LAST_ERROR: &str = "x-last-error";

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for transient messages
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
/// AMQP delivery mode for messages written to disk by durable queues
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Application header value. Headers carry strings or numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl HeaderValue {
    /// Integer view of the value. Numeric strings are accepted since some clients
    /// stringify every header.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            HeaderValue::Str(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(value as i64)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

/// Message headers keyed by name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Per-message broker properties.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageProperties {
    pub content_type: String,
    pub message_id: Option<String>,
    pub persistent: bool,
    pub priority: Option<u8>,
    /// Per-message TTL. Expired messages are dead-lettered by the broker.
    pub expiration: Option<Duration>,
    pub headers: Headers,
}

impl Default for MessageProperties {
    fn default() -> Self {
        MessageProperties {
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: None,
            persistent: true,
            priority: None,
            expiration: None,
            headers: Headers::default(),
        }
    }
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// A message delivered to a consumer subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    /// Delivery mode the publisher chose; kept when the message is republished.
    pub persistent: bool,
    pub priority: Option<u8>,
    pub headers: Headers,
}

impl IncomingMessage {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }
}

pub(crate) fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.as_str())),
    }
}

/// Converts a broker header value. Nested tables, arrays and byte arrays (such as
/// `x-death`) have no application-level counterpart and are skipped.
pub(crate) fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(*v as i64)),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(*v as i64)),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(*v as i64)),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(*v as i64)),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int(*v as i64)),
        AMQPValue::LongUInt(v) => Some(HeaderValue::Int(*v as i64)),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::Timestamp(v) => Some(HeaderValue::Int(*v as i64)),
        AMQPValue::Float(v) => Some(HeaderValue::Float(*v as f64)),
        AMQPValue::Double(v) => Some(HeaderValue::Float(*v)),
        AMQPValue::ShortString(v) => Some(HeaderValue::Str(v.to_string())),
        AMQPValue::LongString(v) => Some(HeaderValue::Str(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}

pub(crate) fn to_field_table(headers: &Headers) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.as_str()), to_amqp_value(value)))
        .collect();

    FieldTable::from(btree)
}

pub(crate) fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let Some(table) = table else {
        return Headers::default();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| from_amqp_value(value).map(|v| (key.to_string(), v)))
        .collect()
}
