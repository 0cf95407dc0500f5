// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Test Helpers
//!
//! Shortcuts for tests running against a live broker: publish with a random request id,
//! or stand up a fresh exchange, queue and subscription in one call. The exchange built
//! here logs disconnects instead of halting the process.

use crate::{
    errors::AmqpError,
    exchange::{Exchange, ExchangeKind, ExchangeOptions},
    message::Message,
    queue::{Queue, QueueOptions, Subscription},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Capacity of the output channel created by [`subscribe`].
pub const OUTPUT_CAPACITY: usize = 1;

/// A random request id.
pub fn request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Options of the `hutch` topic exchange with a non-fatal disconnect callback.
pub fn exchange_options() -> ExchangeOptions {
    ExchangeOptions::new("hutch")
        .kind(ExchangeKind::Topic)
        .durable(true)
        .auto_delete(false)
        .on_disconnect(|| warn!("test exchange lost its connection"))
}

/// Connects a test exchange at `url` (empty for the local broker).
pub async fn exchange(url: &str) -> Result<Arc<Exchange>, AmqpError> {
    Exchange::new(url, Some(exchange_options())).await
}

/// Publishes `message` persistently under `route` with a random request id.
pub async fn publish(exchange: &Exchange, route: &str, message: &str) -> Result<(), AmqpError> {
    exchange
        .publish(route, message.as_bytes(), &request_id())
        .await
}

/// A queue subscribed on its own exchange, with the receiving end of its output.
pub struct TestSubscription {
    pub queue: Queue,
    pub subscription: Subscription,
    pub messages: mpsc::Receiver<Message>,
}

/// Declares `queue_name` bound to `route` on a fresh exchange and subscribes to it.
///
/// `None` options declare a durable, auto-delete queue.
pub async fn subscribe(
    url: &str,
    queue_name: &str,
    route: &str,
    options: Option<QueueOptions>,
) -> Result<TestSubscription, AmqpError> {
    let options = options
        .unwrap_or_else(|| QueueOptions::new().durable(true).auto_delete(true))
        .routing_key(route);

    let queue = Queue::new(queue_name, exchange(url).await?, Some(options)).await?;

    let (output, messages) = mpsc::channel(OUTPUT_CAPACITY);
    let subscription = queue.subscribe(output).await?;

    Ok(TestSubscription {
        queue,
        subscription,
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_random_v4_uuids() {
        let first = request_id();
        let parsed = Uuid::parse_str(&first).unwrap();

        assert_eq!(parsed.get_version_num(), 4);
        assert_ne!(first, request_id());
    }

    #[test]
    fn test_exchange_does_not_halt_on_disconnect() {
        let options = exchange_options();

        assert_eq!(options.name(), "hutch");
        let callback = options.on_disconnect.unwrap();
        (callback.as_ref())();
    }
}
