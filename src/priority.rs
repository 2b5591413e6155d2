// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Priority Queues
//!
//! The broker orders a priority queue's backlog by message priority. Producers set
//! the priority through `PublishOptions::priority`; values above the queue's maximum
//! are treated as the maximum.

use crate::{
    channel::ChannelProvider,
    consumer::{create_consumer, Consumer},
    queue::QueueOptions,
};
use std::sync::Arc;

/// Creates a consumer whose queue is declared with `x-max-priority = max_priority`.
///
/// A queue that already exists keeps the priority setting it was created with.
///
/// # Parameters
/// * `provider` - Source of channels and existence probes
/// * `queue` - Name of the priority queue
/// * `max_priority` - Highest priority the queue honors
/// * `options` - Remaining queue options
///
/// # Returns
/// An uninitialized Consumer for the priority queue
pub fn setup_priority_queue(
    provider: Arc<dyn ChannelProvider>,
    queue: &str,
    max_priority: u8,
    options: QueueOptions,
) -> Consumer {
    create_consumer(provider, queue, options.max_priority(max_priority))
}
