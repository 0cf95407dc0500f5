// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! A [`Queue`] is declared against an [`Exchange`] and shares its channel. It is bound to
//! the exchange lazily, on [`Queue::subscribe`], which starts a task forwarding every
//! delivery to the caller's output channel and returns a [`Subscription`] handle.
//!
//! Lifecycle: `Unbound` → (`subscribe`) → `Consuming` → (disconnect or `close`) →
//! `Terminated`. A terminated queue never consumes again.

use crate::{
    consumer::{self, Forwarder},
    errors::AmqpError,
    exchange::{Exchange, Prefetch},
    message::Message,
    otel, topology,
};
use futures_util::StreamExt;
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions},
    types::FieldTable,
};
use serde::Deserialize;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error};

/// Options used when declaring a new [`Queue`].
///
/// The defaults declare a durable, non auto-delete queue bound with an empty routing key,
/// without prefetch limits, closing the output channel when consumption ends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) routing_key: String,
    pub(crate) prefetch_count: u16,
    pub(crate) prefetch_size: u32,
    pub(crate) close_output: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            auto_delete: false,
            routing_key: String::new(),
            prefetch_count: 0,
            prefetch_size: 0,
            close_output: true,
        }
    }
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable queues survive broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Auto-delete queues are removed once their last consumer is gone.
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Maximum number of unacknowledged deliveries the broker pushes on the channel.
    ///
    /// The limit applies to the whole channel of the exchange, not just this queue.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn prefetch_size(mut self, size: u32) -> Self {
        self.prefetch_size = size;
        self
    }

    /// Whether the output channel is closed when consumption ends (default `true`).
    ///
    /// With `false` the [`Subscription`] keeps the output open for as long as it lives.
    pub fn close_output(mut self, close: bool) -> Self {
        self.close_output = close;
        self
    }

    pub(crate) fn prefetch(&self) -> Prefetch {
        Prefetch {
            count: self.prefetch_count,
            size: self.prefetch_size,
        }
    }
}

/// Counts reported by the broker for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInspection {
    /// Messages ready for delivery (not counting unacknowledged ones).
    pub messages: u32,
    pub consumers: u32,
}

/// Why a subscription stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The broker delivery stream closed without a cancel from us.
    Disconnected,
    /// [`Queue::close`] cancelled the consumer.
    Cancelled,
    /// The receiving side of the output channel was dropped.
    OutputClosed,
}

/// Handle to a running subscription.
pub struct Subscription {
    queue: String,
    state: watch::Receiver<Option<Termination>>,
    _output: Option<mpsc::Sender<Message>>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The termination reason, if the subscription already stopped.
    pub fn termination(&self) -> Option<Termination> {
        *self.state.borrow()
    }

    /// Waits for the subscription to stop.
    pub async fn terminated(&mut self) -> Termination {
        let waited = self
            .state
            .wait_for(Option::is_some)
            .await
            .map(|state| *state);

        match waited {
            Ok(state) => state.unwrap_or(Termination::Cancelled),
            // the forwarding task was aborted by Queue::close
            Err(_) => self.termination().unwrap_or(Termination::Cancelled),
        }
    }
}

enum ConsumerState {
    Unbound,
    Consuming {
        cancelled: Arc<AtomicBool>,
        task: JoinHandle<()>,
    },
    Terminated,
}

impl ConsumerState {
    /// Moves a subscription whose forwarding task already stopped (broker disconnect
    /// or dropped output) to `Terminated`.
    fn settle(&mut self) {
        let stopped = matches!(
            &*self,
            ConsumerState::Consuming { task, .. } if task.is_finished()
        );

        if stopped {
            *self = ConsumerState::Terminated;
        }
    }
}

/// An amqp queue declared against an [`Exchange`].
pub struct Queue {
    name: String,
    routing_key: String,
    close_output: bool,
    exchange: Arc<Exchange>,
    consumer: Mutex<ConsumerState>,
}

impl Queue {
    /// Declares the queue `name` on the channel of `exchange`.
    ///
    /// Positive prefetch limits in `options` are applied to the shared channel; see
    /// `AmqpError::QoSConflict`.
    pub async fn new(
        name: &str,
        exchange: Arc<Exchange>,
        options: Option<QueueOptions>,
    ) -> Result<Queue, AmqpError> {
        let options = options.unwrap_or_default();

        topology::declare_queue(exchange.channel()?, name, &options).await?;

        let prefetch = options.prefetch();
        if prefetch.is_set() {
            exchange.apply_qos(name, prefetch).await?;
        }

        Ok(Queue {
            name: name.to_owned(),
            routing_key: options.routing_key,
            close_output: options.close_output,
            exchange,
            consumer: Mutex::new(ConsumerState::Unbound),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    /// Removes every ready message, returning how many were removed.
    pub async fn purge(&self) -> Result<u32, AmqpError> {
        topology::purge_queue(self.exchange.channel()?, &self.name).await
    }

    pub async fn inspect(&self) -> Result<QueueInspection, AmqpError> {
        topology::inspect_queue(self.exchange.channel()?, &self.name).await
    }

    fn consumer_name(&self) -> &str {
        &self.name
    }

    /// Binds the queue and starts forwarding its deliveries to `output`.
    ///
    /// Messages are not auto-acked: each must be acked or nacked by the reader. Sending
    /// waits for room in `output`, so its capacity plus the prefetch limit bound what the
    /// broker has in flight.
    pub async fn subscribe(
        &self,
        output: mpsc::Sender<Message>,
    ) -> Result<Subscription, AmqpError> {
        let mut state = self.consumer.lock().await;
        state.settle();

        match *state {
            ConsumerState::Unbound => {}
            ConsumerState::Consuming { .. } => {
                return Err(AmqpError::AlreadySubscribed(self.name.clone()))
            }
            ConsumerState::Terminated => {
                return Err(AmqpError::QueueTerminated(self.name.clone()))
            }
        }

        let channel = self.exchange.channel()?;

        topology::bind_queue(channel, &self.name, self.exchange.name(), &self.routing_key).await?;

        let consumer = match channel
            .basic_consume(
                &self.name,
                self.consumer_name(),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(
                    self.name.clone(),
                    err.into(),
                ))
            }
            Ok(c) => Ok(c),
        }?;

        let span_name = self.name.clone();
        let deliveries = consumer.map(move |result| {
            result.map(|delivery| {
                let headers = delivery.properties.headers().as_ref();
                let ctx = otel::consumer_context(headers, &span_name);
                Message::from_delivery(delivery, ctx)
            })
        });

        let cancelled = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(None);
        let retained = (!self.close_output).then(|| output.clone());

        let fwd = Forwarder {
            queue: self.name.clone(),
            cancelled: cancelled.clone(),
            on_disconnect: self.exchange.disconnect_callback(),
            state: state_tx,
        };
        let task = tokio::spawn(consumer::forward(fwd, deliveries, output));

        *state = ConsumerState::Consuming { cancelled, task };

        Ok(Subscription {
            queue: self.name.clone(),
            state: state_rx,
            _output: retained,
        })
    }

    /// Cancels the consumer, closes the owning exchange and waits for the closure.
    ///
    /// Once this returns `Ok` no further message is pushed to the output channel.
    /// Messages already pushed may still be unacknowledged by the reader.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.consumer.lock().await;

        let active = match std::mem::replace(&mut *state, ConsumerState::Terminated) {
            ConsumerState::Consuming { cancelled, task } => Some((cancelled, task)),
            _ => None,
        };

        let Some((cancelled, task)) = active else {
            return self.exchange.close().await;
        };

        cancelled.store(true, Ordering::SeqCst);

        let cancel = self.cancel_consumer().await;
        let closed = close_after_cancel(cancel, self.exchange.close()).await;

        task.abort();
        let _ = task.await;
        debug!(queue = self.name.as_str(), "consumer drained");

        closed
    }

    async fn cancel_consumer(&self) -> Result<(), AmqpError> {
        // a closed channel already dropped the consumer on the broker side
        let Ok(channel) = self.exchange.channel() else {
            return Ok(());
        };

        debug!(queue = self.name.as_str(), "cancelling consumer...");

        match channel
            .basic_cancel(self.consumer_name(), BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to cancel consumer");
                Err(AmqpError::CancelConsumerError(
                    self.name.clone(),
                    err.into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Awaits `close_exchange` whatever the cancel outcome.
///
/// # Returns
/// The cancel error when the cancel failed (a close failure is then only logged),
/// otherwise the close result.
async fn close_after_cancel<F>(
    cancel: Result<(), AmqpError>,
    close_exchange: F,
) -> Result<(), AmqpError>
where
    F: Future<Output = Result<(), AmqpError>>,
{
    let closed = close_exchange.await;

    match cancel {
        Err(err) => {
            if let Err(close_err) = closed {
                error!(error = close_err.to_string(), "failure to close exchange");
            }
            Err(err)
        }
        Ok(()) => closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BrokerError, BrokerErrorKind};

    #[test]
    fn default_options_are_durable_without_prefetch() {
        let options = QueueOptions::default();

        assert!(options.durable);
        assert!(!options.auto_delete);
        assert_eq!(options.routing_key, "");
        assert!(!options.prefetch().is_set());
        assert!(options.close_output);
    }

    #[test]
    fn builder_sets_prefetch() {
        let options = QueueOptions::new()
            .routing_key("amqptest.messages")
            .auto_delete(true)
            .prefetch_count(10)
            .close_output(false);

        assert_eq!(options.routing_key, "amqptest.messages");
        assert!(options.auto_delete);
        assert_eq!(options.prefetch(), Prefetch { count: 10, size: 0 });
        assert!(!options.close_output);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: QueueOptions =
            serde_json::from_str(r#"{"routing_key":"a.b","prefetch_count":5}"#).unwrap();

        assert_eq!(options.routing_key, "a.b");
        assert_eq!(options.prefetch_count, 5);
        assert!(options.durable);
        assert!(options.close_output);
    }

    #[tokio::test]
    async fn subscription_reports_termination() {
        let (tx, rx) = watch::channel(None);
        let mut sub = Subscription {
            queue: "q".to_owned(),
            state: rx,
            _output: None,
        };

        assert_eq!(sub.termination(), None);
        tx.send_replace(Some(Termination::Disconnected));

        assert_eq!(sub.terminated().await, Termination::Disconnected);
        assert_eq!(sub.termination(), Some(Termination::Disconnected));
    }

    #[tokio::test]
    async fn stopped_forwarder_settles_to_terminated() {
        let task = tokio::spawn(async {});
        while !task.is_finished() {
            tokio::task::yield_now().await;
        }

        let mut state = ConsumerState::Consuming {
            cancelled: Arc::new(AtomicBool::new(false)),
            task,
        };
        state.settle();

        assert!(matches!(state, ConsumerState::Terminated));
    }

    #[tokio::test]
    async fn running_forwarder_stays_consuming() {
        let mut state = ConsumerState::Consuming {
            cancelled: Arc::new(AtomicBool::new(false)),
            task: tokio::spawn(std::future::pending::<()>()),
        };
        state.settle();

        assert!(matches!(state, ConsumerState::Consuming { .. }));
        if let ConsumerState::Consuming { task, .. } = state {
            task.abort();
        }

        let mut unbound = ConsumerState::Unbound;
        unbound.settle();
        assert!(matches!(unbound, ConsumerState::Unbound));
    }

    #[tokio::test]
    async fn failed_cancel_still_closes_the_exchange() {
        let cancel_err = || {
            AmqpError::CancelConsumerError(
                "q".to_owned(),
                BrokerError::new(BrokerErrorKind::Closed, "channel closed"),
            )
        };
        let closed = AtomicBool::new(false);

        let result = close_after_cancel(Err(cancel_err()), async {
            closed.store(true, Ordering::SeqCst);
            Err(AmqpError::ChannelUnavailable)
        })
        .await;

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(result, Err(cancel_err()));
    }

    #[tokio::test]
    async fn successful_cancel_reports_the_close_result() {
        let failing_close = async { Err(AmqpError::ChannelUnavailable) };
        let result = close_after_cancel(Ok(()), failing_close).await;
        assert_eq!(result, Err(AmqpError::ChannelUnavailable));

        assert_eq!(close_after_cancel(Ok(()), async { Ok(()) }).await, Ok(()));
    }

    #[tokio::test]
    async fn aborted_forwarder_reads_as_cancelled() {
        let (tx, rx) = watch::channel(None);
        let mut sub = Subscription {
            queue: "q".to_owned(),
            state: rx,
            _output: None,
        };

        drop(tx);

        assert_eq!(sub.terminated().await, Termination::Cancelled);
    }

    #[tokio::test]
    async fn retained_output_stays_open() {
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(1);
        let (_state_tx, rx) = watch::channel(None);
        let sub = Subscription {
            queue: "q".to_owned(),
            state: rx,
            _output: Some(out_tx.clone()),
        };

        drop(out_tx);
        assert!(out_rx.try_recv().is_err());
        assert!(!out_rx.is_closed());

        drop(sub);
        assert!(out_rx.recv().await.is_none());
    }
}
