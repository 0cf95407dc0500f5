// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Topology Operations
//!
//! Declaration, binding and housekeeping calls issued over a channel on behalf of
//! `Exchange` and `Queue`. Every call logs its failure and maps it onto the
//! matching `AmqpError` variant.

use crate::{
    errors::AmqpError,
    exchange::ExchangeOptions,
    queue::{QueueInspection, QueueOptions},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Declares the exchange described by `options` (not internal, not no-wait).
pub(crate) async fn declare_exchange(
    channel: &Channel,
    options: &ExchangeOptions,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", options.name);

    match channel
        .exchange_declare(
            &options.name,
            lapin::ExchangeKind::from(&options.kind),
            ExchangeDeclareOptions {
                passive: false,
                durable: options.durable,
                auto_delete: options.auto_delete,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = options.name.as_str(),
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(
                options.name.clone(),
                err.into(),
            ))
        }
        _ => {
            debug!("exchange: {} was created", options.name);
            Ok(())
        }
    }
}

/// Declares the queue `name` (not exclusive, not no-wait).
pub(crate) async fn declare_queue(
    channel: &Channel,
    name: &str,
    options: &QueueOptions,
) -> Result<(), AmqpError> {
    debug!("creating queue: {}", name);

    match channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                passive: false,
                durable: options.durable,
                exclusive: false,
                auto_delete: options.auto_delete,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to declare the queue");
            Err(AmqpError::DeclareQueueError(name.to_owned(), err.into()))
        }
        _ => {
            debug!("queue: {} was created", name);
            Ok(())
        }
    }
}

/// Binds `queue` to `exchange` with `routing_key`. Binding twice is a no-op on the broker.
pub(crate) async fn bind_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        queue, exchange, routing_key
    );

    match channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");

            Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
                err.into(),
            ))
        }
        _ => Ok(()),
    }
}

/// Removes every ready message of `queue`, returning how many were dropped.
pub(crate) async fn purge_queue(channel: &Channel, queue: &str) -> Result<u32, AmqpError> {
    match channel
        .queue_purge(queue, QueuePurgeOptions { nowait: false })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue, "error to purge the queue");
            Err(AmqpError::PurgeQueueError(queue.to_owned(), err.into()))
        }
        Ok(count) => {
            debug!(queue, count, "queue purged");
            Ok(count)
        }
    }
}

/// Reads the ready message and consumer counts of `queue` with a passive declare.
pub(crate) async fn inspect_queue(
    channel: &Channel,
    queue: &str,
) -> Result<QueueInspection, AmqpError> {
    match channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue, "error to inspect the queue");
            Err(AmqpError::InspectQueueError(queue.to_owned(), err.into()))
        }
        Ok(declared) => Ok(QueueInspection {
            messages: declared.message_count(),
            consumers: declared.consumer_count(),
        }),
    }
}
