// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! A minimal AMQP 0-9-1 client: declare an exchange, publish into it, declare bound
//! queues and consume their deliveries with explicit acknowledgement.
//!
//! ```no_run
//! use hutch::{exchange::Exchange, queue::{Queue, QueueOptions}};
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> Result<(), hutch::errors::AmqpError> {
//! let exchange = Exchange::new("", None).await?;
//! let queue = Queue::new(
//!     "orders",
//!     exchange.clone(),
//!     Some(QueueOptions::new().routing_key("orders.created")),
//! )
//! .await?;
//!
//! let (output, mut messages) = mpsc::channel(1);
//! let _subscription = queue.subscribe(output).await?;
//!
//! exchange.publish("orders.created", b"{}", "req-1").await?;
//!
//! if let Some(msg) = messages.recv().await {
//!     msg.ack().await?;
//! }
//!
//! queue.close().await?;
//! # Ok(())
//! # }
//! ```

mod consumer;
mod otel;
mod topology;

pub mod channel;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod null_acknowledger;
pub mod publisher;
pub mod queue;
pub mod testing;

pub use errors::{AmqpError, BrokerErrorKind};
pub use exchange::{Exchange, ExchangeOptions};
pub use message::{Acknowledger, Message};
pub use null_acknowledger::{Acknowledgement, NullAcknowledger};
pub use queue::{Queue, QueueOptions, Subscription, Termination};
